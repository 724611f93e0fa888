use market_core::{exit, AppConfig};

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return exit::CONFIG;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "tokio runtime failed to start");
            return exit::INTERNAL;
        }
    };

    match runtime.block_on(api_server::run_server(config)) {
        Ok(()) => exit::OK,
        Err(e) => {
            let code = api_server::exit_code_for(&e);
            tracing::error!(error = %e, code, "server exited with error");
            code
        }
    }
}
