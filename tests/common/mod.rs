#![allow(dead_code)]

use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::sync::Arc;

use noir_pipeline::config::ServiceConfig;
use noir_pipeline::engine::ScriptedRunner;
use noir_pipeline::logging::LogBroker;
use noir_pipeline::service::PipelineService;
use tokio::sync::mpsc::UnboundedReceiver;
use zip::write::SimpleFileOptions;

pub const MANIFEST: &str = "[package]\nname = \"main\"\ntype = \"bin\"\n";
pub const MAIN_NR: &str = "fn main(x: Field, y: pub Field) { assert(x != y); }\n";
pub const PROVER_TOML: &str = "x = \"1\"\ny = \"2\"\n";

pub fn zip_of(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, contents) in entries {
        writer.start_file(*name, SimpleFileOptions::default()).unwrap();
        writer.write_all(contents.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// A project packed under a `proj/` folder, as produced by zipping a directory.
pub fn project_zip() -> Vec<u8> {
    zip_of(&[
        ("proj/Nargo.toml", MANIFEST),
        ("proj/src/main.nr", MAIN_NR),
        ("proj/Prover.toml", PROVER_TOML),
    ])
}

pub fn zip_names(bytes: &[u8]) -> Vec<String> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
    (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect()
}

pub fn zip_entry(bytes: &[u8], name: &str) -> Vec<u8> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
    let mut file = archive.by_name(name).unwrap();
    let mut out = Vec::new();
    file.read_to_end(&mut out).unwrap();
    out
}

pub fn config(uploads: &Path) -> ServiceConfig {
    ServiceConfig {
        uploads_dir: uploads.to_path_buf(),
        ..ServiceConfig::default()
    }
}

pub fn service(config: ServiceConfig, runner: ScriptedRunner) -> Arc<PipelineService<ScriptedRunner>> {
    let broker = Arc::new(LogBroker::new());
    let runner = runner.with_broker(broker.clone());
    Arc::new(PipelineService::new(config, runner, broker))
}

pub fn drain(rx: &mut UnboundedReceiver<String>) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(line) = rx.try_recv() {
        out.push(line);
    }
    out
}
