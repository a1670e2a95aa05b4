//! End-to-end exercises of the build state machine against real manifests and
//! a real filesystem, as opposed to the single-target unit coverage in
//! `build::tests`.

use std::path::Path;

use forgebuild::build::{BuildSession, Stage};
use forgebuild::config::{Context, SchedulerPolicy};
use forgebuild::error::Error;
use forgebuild::resolver::{LocalStorage, Resolver};

fn test_context(dir: &Path) -> Context {
    Context::new(
        dir.join("storage"),
        dir.join("build"),
        SchedulerPolicy { jobs: 2, skip_errors: 0, build_always: false, write_output_to_file: false, time_trace: false },
    )
}

fn empty_resolver(dir: &Path) -> Resolver {
    Resolver::new(Vec::new(), LocalStorage::new(dir.join("storage")))
}

fn write_target(dir: &Path, toml: &str) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join("target.toml"), toml).unwrap();
}

#[test]
fn builds_an_executable_that_depends_on_a_library() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = dir.path().join("inputs");
    let lib_out = dir.path().join("libfoo.a");
    let exe_out = dir.path().join("app");

    write_target(
        &inputs.join("libfoo"),
        &format!(
            "[package]\nname = \"org.libfoo\"\nversion = \"0.0.0\"\n\n\
             [[commands]]\nprogram = \"sh\"\nargs = [\"-c\", \"echo lib > {0}\"]\noutputs = [\"{0}\"]\n",
            lib_out.display()
        ),
    );
    write_target(
        &inputs.join("app"),
        &format!(
            "[package]\nname = \"app\"\nversion = \"1.0.0\"\n\
             dependencies = [\"org.libfoo\"]\n\n\
             [[commands]]\nprogram = \"sh\"\nargs = [\"-c\", \"echo bin > {0}\"]\noutputs = [\"{0}\"]\n",
            exe_out.display()
        ),
    );

    let ctx = test_context(dir.path());
    let resolver = empty_resolver(dir.path());
    let mut session = BuildSession::new(&ctx);

    let report = session.build(&inputs, &["app".to_string()], &resolver).unwrap();

    assert_eq!(session.stage(), Stage::Executed);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 0);
    assert!(lib_out.exists());
    assert!(exe_out.exists());
}

#[test]
fn second_build_with_unchanged_inputs_hits_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = dir.path().join("inputs");
    let output = dir.path().join("out.txt");
    write_target(
        &inputs.join("foo"),
        &format!(
            "[package]\nname = \"foo\"\nversion = \"1.0.0\"\n\n\
             [[commands]]\nprogram = \"sh\"\nargs = [\"-c\", \"echo hi > {0}\"]\noutputs = [\"{0}\"]\n",
            output.display()
        ),
    );

    let ctx = test_context(dir.path());
    let resolver = empty_resolver(dir.path());

    let first = BuildSession::new(&ctx).build(&inputs, &["foo".to_string()], &resolver).unwrap();
    assert_eq!(first.succeeded, 1);
    assert_eq!(first.cache_hits, 0);

    let second = BuildSession::new(&ctx).build(&inputs, &["foo".to_string()], &resolver).unwrap();
    assert_eq!(second.succeeded, 0);
    assert_eq!(second.cache_hits, 1);
}

#[test]
fn cyclic_commands_within_a_target_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = dir.path().join("inputs");
    write_target(
        &inputs.join("foo"),
        r#"
[package]
name = "foo"
version = "1.0.0"

[[commands]]
program = "sh"
args = ["-c", "true"]
inputs = ["b.o"]
outputs = ["a.o"]

[[commands]]
program = "sh"
args = ["-c", "true"]
inputs = ["a.o"]
outputs = ["b.o"]
"#,
    );

    let ctx = test_context(dir.path());
    let resolver = empty_resolver(dir.path());
    let err = BuildSession::new(&ctx).build(&inputs, &["foo".to_string()], &resolver).unwrap_err();
    assert!(matches!(err, Error::CyclicDependencies(_)));
}

#[test]
fn unresolved_dependency_fails_the_build_before_execution() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = dir.path().join("inputs");
    write_target(
        &inputs.join("app"),
        r#"
[package]
name = "app"
version = "1.0.0"
dependencies = ["org.missing"]

[[commands]]
program = "sh"
args = ["-c", "true"]
outputs = ["out"]
"#,
    );

    let ctx = test_context(dir.path());
    let resolver = empty_resolver(dir.path());
    let err = BuildSession::new(&ctx).build(&inputs, &["app".to_string()], &resolver).unwrap_err();
    assert!(matches!(err, Error::UnresolvedDependency(_)));
}
