//! Execution plan persistence (4.F) and Chrome-trace timeline emission. The
//! `.swb` format is a small self-describing binary: magic header, the
//! settings snapshot the plan was built against, length-prefixed command
//! records, then a length-prefixed edge list — enough to jump straight to
//! the Execute stage on a subsequent run (6).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::cache::record::{write_frame, FrameReader};
use crate::error::{Error, Result};
use crate::graph::CommandGraph;
use crate::settings::Settings;
use crate::target::Command;

const MAGIC: &[u8; 4] = b"SWB\x01";

/// A self-contained, persisted execution plan: commands, their dependency
/// edges, and the settings tree they were computed under.
pub struct ExecutionPlan {
    pub settings: Settings,
    pub commands: Vec<Command>,
    pub edges: Vec<(u32, u32)>,
}

impl ExecutionPlan {
    pub fn from_graph(settings: Settings, graph: &CommandGraph) -> Self {
        let mut edges = Vec::new();
        for u in 0..graph.len() {
            for &v in graph.successors(u) {
                edges.push((u as u32, v as u32));
            }
        }
        ExecutionPlan {
            settings,
            commands: graph.commands.clone(),
            edges,
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);

        let settings_json = self.settings.to_json_string()?;
        write_frame(&mut buf, settings_json.as_bytes());

        write_frame(&mut buf, &(self.commands.len() as u64).to_le_bytes());
        for cmd in &self.commands {
            write_frame(&mut buf, &encode_command(cmd));
        }

        write_frame(&mut buf, &(self.edges.len() as u64).to_le_bytes());
        for (u, v) in &self.edges {
            let mut edge_buf = Vec::with_capacity(8);
            edge_buf.extend_from_slice(&u.to_le_bytes());
            edge_buf.extend_from_slice(&v.to_le_bytes());
            write_frame(&mut buf, &edge_buf);
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::filesystem(parent, e))?;
        }
        std::fs::write(path, &buf).map_err(|e| Error::filesystem(path, e))?;
        tracing::debug!(path = %path.display(), commands = self.commands.len(), "execution plan saved");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| Error::filesystem(path, e))?;
        if data.len() < 4 || &data[..4] != MAGIC {
            return Err(Error::corrupt_db(path, "missing SWB magic header"));
        }

        let mut reader = FrameReader::new(&data[4..]);
        let settings_json = reader
            .next_frame()
            .ok_or_else(|| Error::corrupt_db(path, "missing settings frame"))?;
        let settings = Settings::from_json_str(
            std::str::from_utf8(settings_json).map_err(|_| Error::corrupt_db(path, "settings not utf8"))?,
        )?;

        let n_commands_frame = reader
            .next_frame()
            .ok_or_else(|| Error::corrupt_db(path, "missing command count frame"))?;
        let n_commands = u64_from_frame(n_commands_frame, path)?;

        let mut commands = Vec::with_capacity(n_commands as usize);
        for _ in 0..n_commands {
            let frame = reader.next_frame().ok_or_else(|| Error::corrupt_db(path, "truncated command list"))?;
            commands.push(decode_command(frame, path)?);
        }

        let n_edges_frame = reader
            .next_frame()
            .ok_or_else(|| Error::corrupt_db(path, "missing edge count frame"))?;
        let n_edges = u64_from_frame(n_edges_frame, path)?;

        let mut edges = Vec::with_capacity(n_edges as usize);
        for _ in 0..n_edges {
            let frame = reader.next_frame().ok_or_else(|| Error::corrupt_db(path, "truncated edge list"))?;
            if frame.len() != 8 {
                return Err(Error::corrupt_db(path, "malformed edge record"));
            }
            let u = u32::from_le_bytes(frame[0..4].try_into().unwrap());
            let v = u32::from_le_bytes(frame[4..8].try_into().unwrap());
            edges.push((u, v));
        }

        tracing::debug!(path = %path.display(), commands = commands.len(), "execution plan loaded");
        Ok(ExecutionPlan { settings, commands, edges })
    }
}

fn u64_from_frame(frame: &[u8], path: &Path) -> Result<u64> {
    if frame.len() != 8 {
        return Err(Error::corrupt_db(path, "malformed count frame"));
    }
    Ok(u64::from_le_bytes(frame.try_into().unwrap()))
}

fn encode_command(cmd: &Command) -> Vec<u8> {
    #[derive(Serialize)]
    struct Wire<'a> {
        program: &'a str,
        args: &'a [String],
        cwd: &'a Option<PathBuf>,
        env: &'a HashMap<String, String>,
        inputs: &'a [PathBuf],
        outputs: &'a [PathBuf],
        depends_on: &'a [String],
    }
    let wire = Wire {
        program: &cmd.program,
        args: &cmd.args,
        cwd: &cmd.cwd,
        env: &cmd.env,
        inputs: &cmd.inputs,
        outputs: &cmd.outputs,
        depends_on: &cmd.depends_on,
    };
    serde_json::to_vec(&wire).expect("command is always serializable")
}

fn decode_command(frame: &[u8], path: &Path) -> Result<Command> {
    #[derive(serde::Deserialize)]
    struct Wire {
        program: String,
        args: Vec<String>,
        cwd: Option<PathBuf>,
        env: HashMap<String, String>,
        inputs: Vec<PathBuf>,
        outputs: Vec<PathBuf>,
        depends_on: Vec<String>,
    }
    let wire: Wire = serde_json::from_slice(frame).map_err(|_| Error::corrupt_db(path, "malformed command record"))?;
    Ok(Command {
        program: wire.program,
        args: wire.args,
        cwd: wire.cwd,
        env: wire.env,
        inputs: wire.inputs,
        outputs: wire.outputs,
        depends_on: wire.depends_on,
    })
}

/// One Chrome-trace event: start time, duration, and level, per command.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub name: String,
    pub ts_micros: u64,
    pub dur_micros: u64,
    pub level: usize,
    pub pid: u32,
    pub tid: usize,
}

#[derive(Serialize)]
struct ChromeTraceEvent<'a> {
    name: &'a str,
    ph: &'static str,
    ts: u64,
    dur: u64,
    pid: u32,
    tid: usize,
}

/// Emits the Chrome Trace Event Format JSON (`misc/time_trace.json`, 6):
/// one complete ("X") event per command, using its level as the thread id so
/// level-parallel commands render on separate tracks.
pub fn write_chrome_trace(path: &Path, events: &[TraceEvent]) -> Result<()> {
    let wire: Vec<ChromeTraceEvent> = events
        .iter()
        .map(|e| ChromeTraceEvent {
            name: &e.name,
            ph: "X",
            ts: e.ts_micros,
            dur: e.dur_micros,
            pid: e.pid,
            tid: e.level,
        })
        .collect();
    let json = serde_json::to_string_pretty(&serde_json::json!({ "traceEvents": wire }))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::filesystem(parent, e))?;
    }
    std::fs::write(path, json).map_err(|e| Error::filesystem(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::Command;

    fn sample_graph() -> CommandGraph {
        let commands = vec![
            Command {
                program: "cc".into(),
                args: vec!["-c".into(), "a.c".into()],
                cwd: None,
                env: HashMap::new(),
                inputs: vec![PathBuf::from("a.c")],
                outputs: vec![PathBuf::from("a.o")],
                depends_on: vec![],
            },
            Command {
                program: "ld".into(),
                args: vec![],
                cwd: None,
                env: HashMap::new(),
                inputs: vec![PathBuf::from("a.o")],
                outputs: vec![PathBuf::from("a.out")],
                depends_on: vec![],
            },
        ];
        CommandGraph::build(commands)
    }

    #[test]
    fn plan_roundtrips_through_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.swb");
        let mut settings = Settings::new();
        settings.insert_scalar("os", "linux");

        let graph = sample_graph();
        let plan = ExecutionPlan::from_graph(settings.clone(), &graph);
        plan.save(&path).unwrap();

        let loaded = ExecutionPlan::load(&path).unwrap();
        assert_eq!(loaded.commands.len(), 2);
        assert_eq!(loaded.edges, vec![(0, 1)]);
        assert_eq!(loaded.settings.get("os").value().unwrap(), "linux");
    }

    #[test]
    fn load_rejects_missing_magic_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.swb");
        std::fs::write(&path, b"not a plan").unwrap();
        assert!(ExecutionPlan::load(&path).is_err());
    }

    #[test]
    fn chrome_trace_writes_valid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("time_trace.json");
        let events = vec![TraceEvent {
            name: "cc -c a.c".into(),
            ts_micros: 0,
            dur_micros: 1500,
            level: 0,
            pid: 1,
            tid: 0,
        }];
        write_chrome_trace(&path, &events).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert!(parsed["traceEvents"].is_array());
    }
}
