//! End-to-end jobs through `PipelineService` with faked tools.

mod common;

use std::io::Write;

use flate2::Compression;
use flate2::write::GzEncoder;
use noir_pipeline::PipelineError;
use noir_pipeline::config::RetentionPolicy;
use noir_pipeline::engine::{JobKind, JobOptions, Profiler, ScriptedRunner};
use noir_pipeline::package::ResponsePayload;
use noir_pipeline::service::JobRequest;
use tempfile::tempdir;

use common::*;

fn request(kind: JobKind, id: &str, archive: Vec<u8>) -> JobRequest {
    JobRequest {
        kind,
        request_id: id.to_string(),
        options: JobOptions::default(),
        archive,
    }
}

#[tokio::test]
async fn compile_nested_project() {
    let tmp = tempdir().unwrap();
    let uploads = tmp.path().join("uploads");
    let svc = service(config(&uploads), ScriptedRunner::noir_toolchain());
    let (ch, mut rx) = svc.broker().open_channel();
    svc.broker().bind("job-1", ch);

    let payload = svc
        .run_job(request(JobKind::Compile, "job-1", project_zip()))
        .await
        .unwrap();

    let ResponsePayload::Inline(inline) = payload else {
        panic!("compile returns inline JSON");
    };
    assert!(inline.success);
    assert_eq!(inline.request_id, "job-1");
    assert!(!inline.compiled_json.unwrap_or_default().is_empty());
    assert_eq!(inline.prover_toml.as_deref(), Some(PROVER_TOML));

    assert!(!uploads.join("job-1").exists(), "workspace must be removed");
    let lines = drain(&mut rx);
    assert!(lines.contains(&"[extract] Removing common root prefix: \"proj/\"".to_string()));
    assert!(lines.contains(&"[nargo] Completed successfully".to_string()));
    assert_eq!(lines.last().map(String::as_str), Some("Compilation succeeded!"));
}

#[tokio::test]
async fn traversal_entries_stay_inside_workspace() {
    let tmp = tempdir().unwrap();
    let uploads = tmp.path().join("uploads");
    let svc = service(config(&uploads), ScriptedRunner::noir_toolchain());

    let archive = zip_of(&[("evil/../../passwd", "root:x:0:0")]);
    let err = svc
        .run_job(request(JobKind::Compile, "evil", archive))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::ManifestNotFound { .. }), "{err:?}");
    assert!(!tmp.path().join("passwd").exists());
    assert!(!uploads.join("passwd").exists());
    assert!(!uploads.join("evil").exists());
    assert!(svc.runner().calls().is_empty());
}

#[tokio::test]
async fn cairo_failure_keeps_solidity_verifier() {
    let tmp = tempdir().unwrap();
    let uploads = tmp.path().join("uploads");
    let runner = ScriptedRunner::noir_toolchain().failing("garaga gen", 1);
    let svc = service(config(&uploads), runner);
    let (ch, mut rx) = svc.broker().open_channel();
    svc.broker().bind("pv", ch);

    let mut req = request(JobKind::ProveWithVerifier, "pv", project_zip());
    req.options.cairo_verifier = true;
    let payload = svc.run_job(req).await.unwrap();

    let ResponsePayload::Archive { filename, bytes } = payload else {
        panic!("prove-with-verifier returns an archive");
    };
    assert_eq!(filename, "verifier_pv.zip");
    let names = zip_names(&bytes);
    assert!(names.contains(&"verifier/solidity/Verifier.sol".to_string()));
    assert!(names.contains(&"proof".to_string()));
    assert!(names.contains(&"vk".to_string()));
    assert!(!names.iter().any(|n| n.starts_with("verifier/cairo/")), "{names:?}");

    let lines = drain(&mut rx);
    assert!(
        lines.iter().any(|l| l.starts_with("Warning: garaga gen failed")),
        "{lines:?}"
    );
    assert!(!uploads.join("pv").exists());
}

#[tokio::test]
async fn prove_with_verifier_packs_cairo_and_profiles() {
    let tmp = tempdir().unwrap();
    let svc = service(config(tmp.path()), ScriptedRunner::noir_toolchain());

    let mut req = request(JobKind::ProveWithVerifier, "full", project_zip());
    req.options = JobOptions {
        profilers: vec![Profiler::Gates],
        cairo_verifier: true,
    };
    let ResponsePayload::Archive { bytes, .. } = svc.run_job(req).await.unwrap() else {
        panic!("expected archive");
    };
    let names = zip_names(&bytes);
    assert!(names.contains(&"verifier/cairo/lib.cairo".to_string()));
    assert!(names.contains(&"verifier/cairo/honk_verifier.cairo".to_string()));
    assert!(names.contains(&"profiler/gates/main_gates.svg".to_string()));
    assert_eq!(zip_entry(&bytes, "vk"), vec![0xde, 0xad, 0xbe, 0xef]);
}

#[tokio::test]
async fn required_failure_stops_pipeline() {
    let tmp = tempdir().unwrap();
    let uploads = tmp.path().join("uploads");
    let runner = ScriptedRunner::noir_toolchain().failing("bb prove", 3);
    let svc = service(config(&uploads), runner);
    let (ch, mut rx) = svc.broker().open_channel();
    svc.broker().bind("fail", ch);

    let err = svc
        .run_job(request(JobKind::Prove, "fail", project_zip()))
        .await
        .unwrap_err();

    assert_eq!(err.exit_code(), Some(3));
    assert_eq!(svc.runner().labels(), vec!["nargo execute", "bb prove"]);
    let lines = drain(&mut rx);
    assert!(
        lines
            .last()
            .is_some_and(|l| l.starts_with("generate-proof failed: [bb] Failed with code 3")),
        "{lines:?}"
    );
    assert!(!uploads.join("fail").exists());
}

#[tokio::test]
async fn retention_on_failure_keeps_failed_workspace() {
    let tmp = tempdir().unwrap();
    let uploads = tmp.path().join("uploads");
    let mut cfg = config(&uploads);
    cfg.retain_workspaces = RetentionPolicy::OnFailure;
    let runner = ScriptedRunner::noir_toolchain().failing("nargo check", 1);
    let svc = service(cfg, runner);

    svc.run_job(request(JobKind::Compile, "kept", project_zip()))
        .await
        .unwrap_err();
    assert!(uploads.join("kept/Nargo.toml").is_file());

    svc.run_job(request(JobKind::Prove, "gone", project_zip()))
        .await
        .unwrap();
    assert!(!uploads.join("gone").exists());
}

#[tokio::test]
async fn concurrent_request_id_is_rejected() {
    let tmp = tempdir().unwrap();
    let uploads = tmp.path().join("uploads");
    std::fs::create_dir_all(uploads.join("busy")).unwrap();
    std::fs::write(uploads.join("busy/marker"), b"in use").unwrap();
    let svc = service(config(&uploads), ScriptedRunner::noir_toolchain());

    let err = svc
        .run_job(request(JobKind::Compile, "busy", project_zip()))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::WorkspaceBusy(_)), "{err:?}");
    assert!(uploads.join("busy/marker").is_file(), "other job's files untouched");
}

#[tokio::test]
async fn invalid_request_id_is_rejected_before_workspace() {
    let tmp = tempdir().unwrap();
    let svc = service(config(tmp.path()), ScriptedRunner::noir_toolchain());
    let err = svc
        .run_job(request(JobKind::Compile, "../escape", project_zip()))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidRequest(_)));
    assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn second_bind_receives_later_lines() {
    let tmp = tempdir().unwrap();
    let svc = service(config(tmp.path()), ScriptedRunner::noir_toolchain());
    let (first, mut first_rx) = svc.broker().open_channel();
    let (second, mut second_rx) = svc.broker().open_channel();
    svc.broker().bind("twice", first);
    svc.broker().bind("twice", second);

    svc.run_job(request(JobKind::Compile, "twice", project_zip()))
        .await
        .unwrap();

    assert!(drain(&mut first_rx).is_empty());
    assert!(!drain(&mut second_rx).is_empty());
}

#[tokio::test]
async fn tar_gz_uploads_are_accepted() {
    let tmp = tempdir().unwrap();
    let svc = service(config(tmp.path()), ScriptedRunner::noir_toolchain());

    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (name, contents) in [
        ("app/Nargo.toml", MANIFEST),
        ("app/src/main.nr", MAIN_NR),
    ] {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, contents.as_bytes()).unwrap();
    }
    let mut gz = builder.into_inner().unwrap();
    gz.flush().unwrap();
    let archive = gz.finish().unwrap();

    let ResponsePayload::Inline(inline) = svc
        .run_job(request(JobKind::Compile, "tgz", archive))
        .await
        .unwrap()
    else {
        panic!("expected inline payload");
    };
    // No Prover.toml was uploaded; `nargo check` wrote the template.
    assert_eq!(inline.prover_toml.as_deref(), Some("x = \"\"\ny = \"\"\n"));
}

#[tokio::test]
async fn empty_and_oversized_uploads() {
    let tmp = tempdir().unwrap();
    let mut cfg = config(tmp.path());
    cfg.max_upload_bytes = 16;
    let svc = service(cfg, ScriptedRunner::noir_toolchain());

    let err = svc
        .run_job(request(JobKind::Compile, "empty", Vec::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::UploadMissing));

    let err = svc
        .run_job(request(JobKind::Compile, "big", project_zip()))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::PayloadTooLarge { limit: 16 }));
}

#[tokio::test]
async fn extraction_budget_bounds_uploads() {
    let tmp = tempdir().unwrap();
    let uploads = tmp.path().join("uploads");
    let mut cfg = config(&uploads);
    cfg.max_extracted_bytes = 64;
    let svc = service(cfg, ScriptedRunner::noir_toolchain());

    let err = svc
        .run_job(request(JobKind::Compile, "bomb", project_zip()))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::ArchiveCorrupt(_)), "{err:?}");
    assert!(svc.runner().calls().is_empty());
    assert!(!uploads.join("bomb").exists());
}
