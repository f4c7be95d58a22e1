use clap::Parser;

mod adapters;
mod cli;
mod commands;

#[tokio::main]
async fn main() -> std::process::ExitCode {
    if let Err(e) = dexopt_core::logging::init() {
        eprintln!("failed to initialize logging: {e}");
        return std::process::ExitCode::from(1);
    }

    let parsed = cli::Cli::parse();
    match parsed.dispatch().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            let code: u8 = if e
                .downcast_ref::<dexopt_core::errors::DexoptError>()
                .map(|e| matches!(e, dexopt_core::errors::DexoptError::InvalidArgument { .. }))
                .unwrap_or(false)
            {
                2
            } else {
                1
            };
            std::process::ExitCode::from(code)
        }
    }
}
