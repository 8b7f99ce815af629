use gdrive_mirror::config::MirrorConfig;
use gdrive_mirror::mirror::{MirrorRuntime, rebuild_index};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    RebuildIndex,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--rebuild-index" => mode = CliMode::RebuildIndex,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_logging();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: gdrive-mirror [--rebuild-index]");
        println!("  --rebuild-index   Regenerate the media index from saved state and exit");
        return Ok(());
    }

    let config = MirrorConfig::from_env()?;
    if mode == CliMode::RebuildIndex {
        let index = rebuild_index(&config).await?;
        tracing::info!(
            directories = index.len(),
            path = %config.index_file.display(),
            "index rebuilt"
        );
        return Ok(());
    }

    let runtime = MirrorRuntime::bootstrap(config).await?;
    runtime.run().await?;
    Ok(())
}
