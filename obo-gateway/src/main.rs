#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]

#[macro_use]
extern crate tracing;

use anyhow::Context as _;
use obo_gateway::config::ConfHandle;
use obo_gateway::service::GatewayService;

enum CliAction {
    ShowHelp,
    Run,
    ConfigInitOnly,
}

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args();
    let executable = args.next().context("executable name is missing from the environment")?;

    // Extract and remove --config-path argument if provided
    let mut config_path = None;
    let mut remaining_args = Vec::new();

    while let Some(arg) = args.next() {
        if arg == "--config-path" {
            if let Some(path) = args.next() {
                config_path = Some(path);
            } else {
                anyhow::bail!("missing value for --config-path");
            }
        } else {
            remaining_args.push(arg);
        }
    }

    if let Some(path) = config_path {
        // SAFETY: At this point the program is single-threaded.
        unsafe { std::env::set_var("OBOGW_CONFIG_PATH", &path) };
    }

    let action = match remaining_args.first().map(String::as_str) {
        Some("--config-init-only") => CliAction::ConfigInitOnly,
        None => CliAction::Run,
        Some(_) => CliAction::ShowHelp,
    };

    match action {
        CliAction::ShowHelp => {
            println!("usage: {executable} [--config-path <PATH>] [--config-init-only]");
            Ok(())
        }
        CliAction::ConfigInitOnly => {
            let path = obo_gateway::config::write_default_conf_file()?;
            println!("Wrote default configuration to {path}");
            Ok(())
        }
        CliAction::Run => run(),
    }
}

fn run() -> anyhow::Result<()> {
    let conf_handle = ConfHandle::init().context("failed to initialize configuration")?;

    let mut service = GatewayService::load(conf_handle).context("failed to load the service")?;

    service.start()?;

    service.wait_for_shutdown_signal();

    info!("Received interruption signal");

    service.stop();

    Ok(())
}
