use std::sync::Arc;

use clap::Parser;
use cvd_orchestrator::{
    artifacts::{AndroidBuildApi, BuildApi, BuildApiFactory},
    cli::{Cli, Command, Config},
    cvd::default_exec_context,
    operation::OperationManager,
    orchestrator::{
        default_fetcher_factory, HostValidator, InstanceManager, InstanceManagerOpts, Paths,
    },
    rpc_server::RpcServer,
    types::AndroidBuild,
};
use eyre::Result;
use tracing_subscriber::{filter::LevelFilter, fmt::format::FmtSpan, EnvFilter};

fn start_logger(default_level: LevelFilter) {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        _ => EnvFilter::default().add_directive(default_level.into()),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    start_logger(LevelFilter::INFO);

    let cli = Cli::parse();
    match cli.subcommand {
        Command::Run { config } => run(config).await,
        Command::ShowConfig { config } => {
            println!("{config:#?}");
            Ok(())
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let paths = Paths::from_root(&config.data_directory);
    let exec = default_exec_context();

    let http_client = reqwest::Client::builder().build()?;
    let build_api = Arc::new(AndroidBuildApi::new(
        &config.android_build_url,
        "",
        http_client,
    )?);
    let build_api_factory: BuildApiFactory = Arc::new(move |credentials: &str| {
        Arc::new(build_api.with_credentials(credentials)) as Arc<dyn BuildApi>
    });
    let fetcher_factory = default_fetcher_factory(
        exec.clone(),
        &paths.fetch_cvd_bin(),
        build_api_factory.clone(),
        config.fetch_timeout(),
    );

    let instance_manager = Arc::new(InstanceManager::new(InstanceManagerOpts {
        exec,
        cvd_user: config.cvd_user.clone(),
        cvd_tools_build: AndroidBuild {
            id: config.cvd_build_id.clone(),
            target: config.cvd_build_target.clone(),
        },
        paths,
        operations: Arc::new(OperationManager::new()),
        build_api_factory,
        fetcher_factory,
        host_validator: Arc::new(HostValidator),
        cvd_start_timeout: config.cvd_start_timeout(),
    }));

    let rpc_server = RpcServer::run(&config, instance_manager).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    rpc_server.stop().await?;

    Ok(())
}
