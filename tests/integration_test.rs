use almaqso::clients::{ArchiveService, DataFetcher};
use almaqso::config::{Config, ImagingMode};
use almaqso::error::{ArchiveError, EngineError, FileError};
use almaqso::infrastructure::{ComputeEngine, EngineOutput};
use almaqso::models::{ArchiveRecord, SelectionSet, UnitStatus};
use almaqso::services::step_selector::{PROBE_LINE_INDEX, SHORT_VARIANT_LABEL};
use almaqso::utils::{ConsoleSink, LogAggregator, LogFileMode};
use almaqso::App;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::instrument::WithSubscriber;

const PROJECT: &str = "2017.1.00001.S";

fn url_for(uid: &str) -> String {
    format!("https://almascience.nao.ac.jp/dataPortal/{PROJECT}_{uid}.asdm.sdm.tar")
}

/// 固定返回若干记录，并检查收到的过滤条件
struct MockArchive {
    urls: Vec<String>,
    queries: Mutex<Vec<(String, Vec<u32>, Vec<u32>)>>,
    fail: bool,
}

impl MockArchive {
    fn new(uids: &[&str]) -> Self {
        Self::with_urls(uids.iter().map(|u| url_for(u)).collect())
    }

    fn with_urls(urls: Vec<String>) -> Self {
        Self {
            urls,
            queries: Mutex::new(Vec::new()),
            fail: false,
        }
    }
}

#[async_trait]
impl ArchiveService for MockArchive {
    async fn query(
        &self,
        target: &str,
        bands: &SelectionSet,
        cycles: &SelectionSet,
    ) -> Result<Vec<ArchiveRecord>, ArchiveError> {
        self.queries
            .lock()
            .unwrap()
            .push((target.to_string(), bands.to_vec(), cycles.to_vec()));
        if self.fail {
            return Err(ArchiveError::Transient {
                endpoint: "/tap/sync".to_string(),
                message: "HTTP 503".to_string(),
            });
        }
        Ok(self
            .urls
            .iter()
            .map(|url| ArchiveRecord {
                url: url.clone(),
                size_bytes: 2 * 1024 * 1024 * 1024,
            })
            .collect())
    }
}

/// 写一个空压缩包，解包时造出 ASDM 目录结构
#[derive(Default)]
struct MockFetcher {
    fail_for: Option<&'static str>,
}

#[async_trait]
impl DataFetcher for MockFetcher {
    async fn download(&self, url: &str, dest_dir: &Path) -> Result<PathBuf, ArchiveError> {
        if self.fail_for.is_some_and(|uid| url.contains(uid)) {
            return Err(ArchiveError::Download {
                url: url.to_string(),
                message: "connection reset".to_string(),
            });
        }
        let path = dest_dir.join(almaqso::models::file_name_from_url(url));
        std::fs::write(&path, b"tar").unwrap();
        Ok(path)
    }

    async fn extract(&self, archive: &Path, unit_dir: &Path) -> Result<(), FileError> {
        let name = archive.file_name().unwrap().to_string_lossy().into_owned();
        let uid = name
            .split("_uid___")
            .nth(1)
            .unwrap()
            .trim_end_matches(".asdm.sdm.tar");
        let raw = unit_dir.join(format!("{PROJECT}/sg/gr/mb/raw/uid___{uid}.asdm.sdm"));
        std::fs::create_dir_all(raw).unwrap();
        Ok(())
    }
}

/// 记录调用过的脚本；生成校准脚本时写出探测行
#[derive(Default)]
struct MockEngine {
    calls: Mutex<Vec<(PathBuf, String)>>,
}

#[async_trait]
impl ComputeEngine for MockEngine {
    async fn run_file(&self, workdir: &Path, script_name: &str) -> Result<EngineOutput, EngineError> {
        self.calls
            .lock()
            .unwrap()
            .push((workdir.to_path_buf(), script_name.to_string()));

        if script_name == "make_script.py" {
            let script = std::fs::read_to_string(workdir.join(script_name)).unwrap();
            let vis = script
                .lines()
                .find_map(|l| l.strip_prefix("vis = \""))
                .and_then(|l| l.strip_suffix('"'))
                .unwrap()
                .to_string();
            let mut lines: Vec<String> = (0..PROBE_LINE_INDEX).map(|i| format!("# {i}")).collect();
            lines.push(format!("  16: '{SHORT_VARIANT_LABEL}',"));
            std::fs::write(
                workdir.join(format!("{vis}.scriptForCalibration.py")),
                lines.join("\n"),
            )
            .unwrap();
        }
        std::fs::write(workdir.join("casa-1.log"), "INFO ok\n").unwrap();

        Ok(EngineOutput::default())
    }
}

fn config(work_dir: &Path) -> Config {
    let mut config = Config::default();
    config.targets = vec!["X".to_string()];
    config.band = "7".to_string();
    config.cycle = "4,6~10".to_string();
    config.work_dir = work_dir.to_path_buf();
    config.resume = true;
    config.n_parallel = 2;
    config.stages.tclean = true;
    config.tclean.modes = vec![ImagingMode::Mfs];
    config
}

#[tokio::test]
async fn test_resume_skips_previously_successful_unit() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    std::fs::write(config.ledger_path(), "uid___A002_X1_X1\n").unwrap();

    let aggregator = LogAggregator::start(
        dir.path().join("run.log"),
        LogFileMode::Create,
        ConsoleSink::Disabled,
    )
    .unwrap();
    let log = aggregator.handle("main");

    let archive = Arc::new(MockArchive::new(&["uid___A002_X1_X1", "uid___A002_X1_X2"]));
    let engine = Arc::new(MockEngine::default());
    let app = App::with_services(
        config.clone(),
        log.clone(),
        archive.clone(),
        Arc::new(MockFetcher::default()),
        engine.clone(),
    );

    let summary = app
        .run()
        .with_subscriber(log.dispatch())
        .await
        .unwrap();
    aggregator.stop().unwrap();

    assert_eq!(
        archive.queries.lock().unwrap().clone(),
        vec![("X".to_string(), vec![7], vec![4, 6, 7, 8, 9, 10])]
    );

    assert_eq!(summary.total(), 2);
    assert_eq!(
        summary.status_of("uid___A002_X1_X1"),
        Some(&UnitStatus::PreviouslySuccessful)
    );
    assert_eq!(summary.status_of("uid___A002_X1_X2"), Some(&UnitStatus::Success));

    // 只有新单元进入了流程
    let calls = engine.calls.lock().unwrap().clone();
    assert!(!calls.is_empty());
    assert!(calls
        .iter()
        .all(|(workdir, _)| workdir.ends_with("uid___A002_X1_X2")));
    assert!(!dir.path().join("uid___A002_X1_X1").exists());

    let log_text = std::fs::read_to_string(dir.path().join("run.log")).unwrap();
    assert_eq!(log_text.matches("跳过之前已成功处理的单元").count(), 1);
    assert!(log_text.contains("[uid___A002_X1_X2]"));

    let ledger = std::fs::read_to_string(config.ledger_path()).unwrap();
    assert_eq!(
        ledger.lines().collect::<Vec<_>>(),
        vec!["uid___A002_X1_X1", "uid___A002_X1_X2"]
    );
}

#[tokio::test]
async fn test_fresh_run_clears_ledger_and_reports_download_failure() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.resume = false;
    std::fs::write(config.ledger_path(), "uid___A002_X1_X1\n").unwrap();
    // 上次中断留下的压缩包
    std::fs::write(dir.path().join(format!("{PROJECT}_uid___old.asdm.sdm.tar")), "x").unwrap();

    let aggregator = LogAggregator::start(
        dir.path().join("run.log"),
        LogFileMode::Create,
        ConsoleSink::Disabled,
    )
    .unwrap();
    let log = aggregator.handle("main");

    let app = App::with_services(
        config.clone(),
        log.clone(),
        Arc::new(MockArchive::new(&["uid___A002_X1_X1", "uid___A002_X1_X2"])),
        Arc::new(MockFetcher {
            fail_for: Some("uid___A002_X1_X2"),
        }),
        Arc::new(MockEngine::default()),
    );

    let summary = app
        .run()
        .with_subscriber(log.dispatch())
        .await
        .unwrap();
    aggregator.stop().unwrap();

    assert!(!dir
        .path()
        .join(format!("{PROJECT}_uid___old.asdm.sdm.tar"))
        .exists());
    assert_eq!(summary.total(), 2);
    assert_eq!(summary.skipped(), 0);
    assert_eq!(summary.status_of("uid___A002_X1_X1"), Some(&UnitStatus::Success));
    assert!(matches!(
        summary.status_of("uid___A002_X1_X2"),
        Some(UnitStatus::Failed(_))
    ));

    let ledger = std::fs::read_to_string(config.ledger_path()).unwrap();
    assert_eq!(ledger.lines().collect::<Vec<_>>(), vec!["uid___A002_X1_X1"]);
}

#[tokio::test]
async fn test_archive_failure_aborts_run() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());

    let aggregator = LogAggregator::start(
        dir.path().join("run.log"),
        LogFileMode::Create,
        ConsoleSink::Disabled,
    )
    .unwrap();
    let log = aggregator.handle("main");

    let mut archive = MockArchive::new(&["uid___A002_X1_X1"]);
    archive.fail = true;
    let engine = Arc::new(MockEngine::default());
    let app = App::with_services(
        config,
        log.clone(),
        Arc::new(archive),
        Arc::new(MockFetcher::default()),
        engine.clone(),
    );

    let result = app.run().with_subscriber(log.dispatch()).await;
    aggregator.stop().unwrap();

    assert!(result.is_err());
    assert!(engine.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unsafe_identity_never_touches_work_root() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    std::fs::write(config.ledger_path(), "uid___A002_X1_X1\n").unwrap();
    std::fs::write(dir.path().join("notes.txt"), "keep me").unwrap();
    std::fs::create_dir_all(dir.path().join("uid___A002_X1_X1")).unwrap();

    let aggregator = LogAggregator::start(
        dir.path().join("run.log"),
        LogFileMode::Create,
        ConsoleSink::Disabled,
    )
    .unwrap();
    let log = aggregator.handle("main");

    let archive = MockArchive::with_urls(vec![
        "https://almascience.nao.ac.jp/dataPortal/.asdm.sdm.tar".to_string(),
        url_for("uid___A002_X1_X2"),
    ]);
    let app = App::with_services(
        config.clone(),
        log.clone(),
        Arc::new(archive),
        Arc::new(MockFetcher::default()),
        Arc::new(MockEngine::default()),
    );

    let summary = app
        .run()
        .with_subscriber(log.dispatch())
        .await
        .unwrap();
    aggregator.stop().unwrap();

    assert!(dir.path().join("notes.txt").is_file());
    assert!(dir.path().join("uid___A002_X1_X1").is_dir());

    assert_eq!(summary.total(), 2);
    assert!(matches!(
        summary.status_of(".asdm.sdm.tar"),
        Some(UnitStatus::Failed(_))
    ));
    assert_eq!(summary.status_of("uid___A002_X1_X2"), Some(&UnitStatus::Success));

    let ledger = std::fs::read_to_string(config.ledger_path()).unwrap();
    assert_eq!(
        ledger.lines().collect::<Vec<_>>(),
        vec!["uid___A002_X1_X1", "uid___A002_X1_X2"]
    );
}

#[tokio::test]
async fn test_fresh_run_without_units_still_clears_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.resume = false;
    std::fs::write(config.ledger_path(), "uid___A002_X1_X1\n").unwrap();

    let aggregator = LogAggregator::start(
        dir.path().join("run.log"),
        LogFileMode::Create,
        ConsoleSink::Disabled,
    )
    .unwrap();
    let log = aggregator.handle("main");

    let engine = Arc::new(MockEngine::default());
    let app = App::with_services(
        config.clone(),
        log.clone(),
        Arc::new(MockArchive::new(&[])),
        Arc::new(MockFetcher::default()),
        engine.clone(),
    );

    let summary = app
        .run()
        .with_subscriber(log.dispatch())
        .await
        .unwrap();
    aggregator.stop().unwrap();

    assert_eq!(summary.total(), 0);
    assert!(engine.calls.lock().unwrap().is_empty());
    let ledger = std::fs::read_to_string(config.ledger_path()).unwrap_or_default();
    assert!(ledger.is_empty());
}
