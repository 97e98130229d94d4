//! lxe-net - bridge and CNI network provisioning for LXE
//!
//! Command-line front end over the lxe_net library.

mod cli;

use cli::{BridgeAction, Cli, CniAction, Commands};
use lxe_net::cni::{CniPlugin, PropertiesRunning, RESULT_KEY};
use lxe_net::controller::HttpController;
use lxe_net::manifest::{self, NetConfig};
use lxe_net::network::{AddressAllocator, Reservations, ensure_bridge, find_free_ip_bridge};
use lxe_net::{Context, Result};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Instant;
use tracing::{Level, debug};
use tracing_subscriber::fmt::time::FormatTime;

/// Log timestamps relative to process start
struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        write!(w, "[{:>4}.{:03}]", d.as_secs(), d.subsec_millis())
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Load the config file, falling back to defaults when it does not exist
fn load_config(path: &Path) -> Result<NetConfig> {
    if path.exists() {
        return manifest::load(path);
    }
    debug!(path = %path.display(), "config file not found, using defaults");
    let config = NetConfig::default();
    config.validate()?;
    Ok(config)
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();

    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Completions { shell } = cli.command {
        Cli::generate_completion(shell);
        return Ok(());
    }

    let config = load_config(&cli.config)?;
    let ctx = Context::background();

    match cli.command {
        Commands::Completions { .. } => {}

        Commands::Check => {
            println!("Configuration OK");
            println!("  controller: {}", config.controller.url);
            println!(
                "  bridge:     {} ({})",
                config.bridge.name,
                if config.bridge.cidr.is_empty() {
                    "auto"
                } else {
                    config.bridge.cidr.as_str()
                }
            );
            println!("  cni conf:   {}", config.cni.conf_dir.display());
        }

        Commands::Bridge { action } => {
            let controller = HttpController::new(&config.controller).with_context(ctx);
            match action {
                BridgeAction::Ensure {
                    name,
                    cidr,
                    create_only,
                } => {
                    let name = name.unwrap_or(config.bridge.name);
                    let cidr = cidr.unwrap_or(config.bridge.cidr);
                    ensure_bridge(
                        &controller,
                        &name,
                        &cidr,
                        true,
                        config.bridge.create_only || create_only,
                    )?;
                    println!("Bridge '{}' is ready", name);
                }
                BridgeAction::FreeIp { name, json } => {
                    let name = name.unwrap_or(config.bridge.name);
                    let mut allocator = AddressAllocator::new();
                    if let Some(max_probes) = config.allocation.max_probes {
                        allocator = allocator.with_max_probes(max_probes);
                    }
                    let reservations = Reservations::new(allocator);
                    let address = find_free_ip_bridge(&controller, &reservations, &name)?;

                    if json {
                        let out = serde_json::json!({ "bridge": name, "address": address });
                        println!("{}", serde_json::to_string_pretty(&out)?);
                    } else {
                        println!("{}", address);
                    }
                }
            }
        }

        Commands::Cni { action } => {
            let plugin = CniPlugin::from_config(&config.cni);
            match action {
                CniAction::Attach {
                    namespace,
                    name,
                    container,
                    pid,
                } => {
                    let result = plugin.attach_interface(&ctx, &namespace, &name, &container, pid)?;
                    println!("{}", result.raw().unwrap_or_default());
                }
                CniAction::Detach {
                    namespace,
                    name,
                    container,
                    pid,
                } => {
                    plugin.detach_interface(&ctx, &namespace, &name, &container, pid)?;
                    println!("Detached container '{}'", container);
                }
                CniAction::Status {
                    namespace,
                    name,
                    container,
                    pid,
                    result,
                    json,
                } => {
                    let props = PropertiesRunning::new(pid)
                        .with_data(HashMap::from([(RESULT_KEY.to_string(), result)]));
                    let status = plugin.interface_status(&ctx, &namespace, &name, &container, &props)?;

                    if json {
                        println!("{}", serde_json::to_string_pretty(&status)?);
                    } else {
                        println!("{:<12} {:<20} GATEWAY", "INTERFACE", "ADDRESS");
                        for ip in &status.ips {
                            println!(
                                "{:<12} {:<20} {}",
                                ip.interface.as_deref().unwrap_or("-"),
                                ip.address,
                                ip.gateway.map(|g| g.to_string()).unwrap_or_else(|| "-".into())
                            );
                        }
                    }
                }
            }
        }
    }

    Ok(())
}
