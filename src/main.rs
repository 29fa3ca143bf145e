//! tsfeature-curate - 快照整理工具
//!
//! 读取快照，(可选) 用标准主运算补算缺失单元格，整理后另存为新快照。
//!
//! 用法:
//!   tsfeature-curate [--config PATH] [--compute] <input> <output>
//!   tsfeature-curate [--config PATH] --list

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use tsfeature::observability::metrics;
use tsfeature::store::FileSnapshotStore;
use tsfeature::utils::config::TsFeatureConfig;
use tsfeature::{curate, BatchScheduler, MasterRegistry, SnapshotStore};

const USAGE: &str = "usage: tsfeature-curate [--config PATH] [--compute] <input> <output>\n       tsfeature-curate [--config PATH] --list";

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    compute: bool,
    list: bool,
    positional: Vec<String>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args::default();
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = iter.next().context("--config needs a path")?;
                args.config = Some(PathBuf::from(path));
            }
            "--compute" => args.compute = true,
            "--list" => args.list = true,
            "--help" | "-h" => {
                println!("{}", USAGE);
                std::process::exit(0);
            }
            flag if flag.starts_with('-') => bail!("unknown flag '{}'\n{}", flag, USAGE),
            _ => args.positional.push(arg),
        }
    }
    if !args.list && args.positional.len() != 2 {
        bail!("{}", USAGE);
    }
    Ok(args)
}

fn main() -> Result<()> {
    let args = parse_args()?;

    // 1. 配置 (显式指定的文件必须可读；默认文件缺失时使用默认值)
    let (config, fallback) = match &args.config {
        Some(path) => (
            TsFeatureConfig::load_from_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None,
        ),
        None => match TsFeatureConfig::load_default() {
            Ok(cfg) => (cfg, None),
            Err(e) => (TsFeatureConfig::default(), Some(e)),
        },
    };

    // 2. 日志 (RUST_LOG 优先)
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log.level.as_str()),
    )
    .init();
    if let Some(e) = fallback {
        log::warn!("Failed to load config file: {}, using defaults", e);
    }
    metrics::init_metrics();

    let store = FileSnapshotStore::new(config.storage.to_store_config())
        .with_context(|| format!("opening snapshot store {}", config.storage.base_path.display()))?;

    if args.list {
        for name in store.list()? {
            println!("{}", name);
        }
        return Ok(());
    }

    let (input, output) = (&args.positional[0], &args.positional[1]);
    let mut snapshot = store
        .load(input)
        .with_context(|| format!("loading snapshot '{}'", input))?;
    log::info!(
        "Loaded snapshot '{}': {}x{}, {} masters",
        input,
        snapshot.store.n_rows(),
        snapshot.store.n_cols(),
        snapshot.masters.len()
    );

    // 3. 补算
    if args.compute {
        let scheduler = BatchScheduler::new(
            Arc::new(MasterRegistry::with_standard_masters()),
            config.scheduler.clone(),
        );
        let report = scheduler
            .run_snapshot(&mut snapshot)
            .context("batch compute failed")?;
        log::info!(
            "Computed {} cells in {:?}",
            report.cells.total(),
            report.elapsed
        );
    }

    // 4. 整理并保存；失败时不写出任何快照
    let outcome = curate(snapshot, &config.curation)
        .with_context(|| format!("curating snapshot '{}'", input))?;
    store
        .save(output, &outcome.snapshot)
        .with_context(|| format!("saving snapshot '{}'", output))?;

    println!("{}", outcome.report.to_json()?);
    log::debug!("Metrics:\n{}", metrics::export_metrics());
    Ok(())
}
