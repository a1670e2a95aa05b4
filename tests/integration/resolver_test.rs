//! End-to-end exercises of the dependency resolver (4.D) and its binding into
//! the build session's target graph, as opposed to the single-catalog unit
//! coverage in `resolver::tests`.

use std::path::Path;

use forgebuild::build::{BuildSession, Stage};
use forgebuild::config::{Context, SchedulerPolicy};
use forgebuild::error::Error;
use forgebuild::resolver::{DirectoryCatalog, LocalStorage, Resolver};

fn test_context(dir: &Path) -> Context {
    Context::new(
        dir.join("storage"),
        dir.join("build"),
        SchedulerPolicy { jobs: 1, skip_errors: 0, build_always: false, write_output_to_file: false, time_trace: false },
    )
}

fn write_catalog_entry(catalog_root: &Path, path: &str, version: &str, toml: &str) {
    let dir = catalog_root.join(path.replace('.', "/")).join(version);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("target.toml"), toml).unwrap();
}

fn write_target(dir: &Path, toml: &str) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join("target.toml"), toml).unwrap();
}

/// S6-adjacent: a dependency not already present among loaded targets is
/// fetched from the catalog, materialized into local storage, and bound
/// during `load_packages` — the build then proceeds to completion.
#[test]
fn dependency_absent_from_inputs_is_fetched_from_catalog_and_bound() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = dir.path().join("inputs");
    let catalog_root = dir.path().join("catalog");
    let lib_out = dir.path().join("libfoo.a");
    let exe_out = dir.path().join("app");

    write_catalog_entry(
        &catalog_root,
        "org.libfoo",
        "1.0.0",
        &format!(
            "[package]\nname = \"org.libfoo\"\nversion = \"1.0.0\"\n\n\
             [[commands]]\nprogram = \"sh\"\nargs = [\"-c\", \"echo lib > {0}\"]\noutputs = [\"{0}\"]\n",
            lib_out.display()
        ),
    );
    write_target(
        &inputs.join("app"),
        &format!(
            "[package]\nname = \"app\"\nversion = \"1.0.0\"\n\
             dependencies = [\"org.libfoo >= 1.0.0\"]\n\n\
             [[commands]]\nprogram = \"sh\"\nargs = [\"-c\", \"echo bin > {0}\"]\noutputs = [\"{0}\"]\n",
            exe_out.display()
        ),
    );

    let ctx = test_context(dir.path());
    let storage = LocalStorage::new(dir.path().join("storage"));
    let resolver = Resolver::new(
        vec![Box::new(DirectoryCatalog::new("local", catalog_root))],
        storage,
    );

    let mut session = BuildSession::new(&ctx);
    let report = session.build(&inputs, &["app".to_string()], &resolver).unwrap();

    assert_eq!(session.stage(), Stage::Executed);
    assert_eq!(report.succeeded, 2);
    assert!(lib_out.exists());
    assert!(exe_out.exists());
}

/// 4.D's highest-satisfying-version contract holds across the whole
/// pipeline, not just the resolver in isolation: a range excluding the
/// newest catalog version must bind to the next-highest one.
#[test]
fn resolver_picks_highest_version_satisfying_the_requested_range() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = dir.path().join("inputs");
    let catalog_root = dir.path().join("catalog");
    let out = dir.path().join("out.txt");

    write_catalog_entry(
        &catalog_root,
        "org.libfoo",
        "1.0.0",
        "[package]\nname = \"org.libfoo\"\nversion = \"1.0.0\"\n",
    );
    write_catalog_entry(
        &catalog_root,
        "org.libfoo",
        "1.5.0",
        "[package]\nname = \"org.libfoo\"\nversion = \"1.5.0\"\n",
    );
    write_catalog_entry(
        &catalog_root,
        "org.libfoo",
        "2.0.0",
        "[package]\nname = \"org.libfoo\"\nversion = \"2.0.0\"\n",
    );
    write_target(
        &inputs.join("app"),
        &format!(
            "[package]\nname = \"app\"\nversion = \"1.0.0\"\n\
             dependencies = [\"org.libfoo <2.0.0\"]\n\n\
             [[commands]]\nprogram = \"sh\"\nargs = [\"-c\", \"echo bin > {0}\"]\noutputs = [\"{0}\"]\n",
            out.display()
        ),
    );

    let ctx = test_context(dir.path());
    let storage = LocalStorage::new(dir.path().join("storage"));
    let resolver = Resolver::new(
        vec![Box::new(DirectoryCatalog::new("local", catalog_root))],
        LocalStorage::new(dir.path().join("storage")),
    );

    let report = BuildSession::new(&ctx).build(&inputs, &["app".to_string()], &resolver).unwrap();
    assert_eq!(report.succeeded, 1);
    assert!(out.exists());

    let picked_dir = storage.package_dir(&forgebuild::package::PackageId {
        path: forgebuild::package::PackagePath::parse("org.libfoo"),
        version: forgebuild::package::version::PackageVersion::parse("1.5.0").unwrap(),
    });
    assert!(picked_dir.exists());
}

/// A dependency with no catalog offering a matching version fails the build
/// before any command is ever gathered, let alone executed.
#[test]
fn no_matching_version_in_any_catalog_surfaces_unresolved_dependency() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = dir.path().join("inputs");
    let catalog_root = dir.path().join("catalog");

    write_catalog_entry(
        &catalog_root,
        "org.libfoo",
        "1.0.0",
        "[package]\nname = \"org.libfoo\"\nversion = \"1.0.0\"\n",
    );
    write_target(
        &inputs.join("app"),
        r#"
[package]
name = "app"
version = "1.0.0"
dependencies = ["org.libfoo >= 2.0.0"]

[[commands]]
program = "sh"
args = ["-c", "true"]
outputs = ["out"]
"#,
    );

    let ctx = test_context(dir.path());
    let resolver = Resolver::new(
        vec![Box::new(DirectoryCatalog::new("local", catalog_root))],
        LocalStorage::new(dir.path().join("storage")),
    );

    let err = BuildSession::new(&ctx).build(&inputs, &["app".to_string()], &resolver).unwrap_err();
    assert!(matches!(err, Error::UnresolvedDependency(_)));
}

/// Second catalog in priority order is only consulted once the first offers
/// no matching version — mirrors the unit-level coverage in
/// `resolver::tests`, but exercised through the full build pipeline.
#[test]
fn second_catalog_is_used_when_first_catalog_lacks_the_package() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = dir.path().join("inputs");
    let first_catalog = dir.path().join("catalog-a");
    let second_catalog = dir.path().join("catalog-b");
    let out = dir.path().join("out.txt");

    write_catalog_entry(
        &second_catalog,
        "org.libbar",
        "2.0.0",
        "[package]\nname = \"org.libbar\"\nversion = \"2.0.0\"\n",
    );
    write_target(
        &inputs.join("app"),
        &format!(
            "[package]\nname = \"app\"\nversion = \"1.0.0\"\n\
             dependencies = [\"org.libbar\"]\n\n\
             [[commands]]\nprogram = \"sh\"\nargs = [\"-c\", \"echo bin > {0}\"]\noutputs = [\"{0}\"]\n",
            out.display()
        ),
    );

    let ctx = test_context(dir.path());
    let resolver = Resolver::new(
        vec![
            Box::new(DirectoryCatalog::new("first", first_catalog)),
            Box::new(DirectoryCatalog::new("second", second_catalog)),
        ],
        LocalStorage::new(dir.path().join("storage")),
    );

    let report = BuildSession::new(&ctx).build(&inputs, &["app".to_string()], &resolver).unwrap();
    assert_eq!(report.succeeded, 1);
    assert!(out.exists());
}
