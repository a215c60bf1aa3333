//! Modbus RTU master for Ectocontrol adapters.
//!
//! Polls every configured adapter and logs its state changes.

use std::sync::Arc;

use anyhow::{Context, Result};
use ectobus_common::{ServiceArgs, ServiceConfig};
use ectobus_modbus::config::{DeviceConfig, EctobusConfig};
use ectobus_modbus::coordinator::{CoordinatorEvent, CoordinatorHandle, PollingCoordinator};
use ectobus_modbus::gateway::DeviceGateway;
use ectobus_modbus::registers::RegisterTables;
use ectobus_modbus::registry::LinkRegistry;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = ServiceArgs::parse_with_default("ectobus.json5");

    let config = EctobusConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    let log_config = config
        .logging()
        .with_level_override(args.log_level.as_deref());
    ectobus_common::init_tracing(&log_config).context("Failed to init tracing")?;

    info!("Starting ectobus");
    info!("Loaded configuration from {:?}", args.config);

    let registry = LinkRegistry::new();
    let mut coordinators = Vec::new();
    let mut tasks = Vec::new();

    for device in &config.modbus.devices {
        match start_device(&registry, device, &config.modbus.registers).await {
            Ok((handle, task)) => {
                coordinators.push(handle);
                tasks.push(task);
            }
            Err(e) => error!(device = %device.name, "Skipping device: {:#}", e),
        }
    }

    if coordinators.is_empty() {
        registry.close_all().await;
        anyhow::bail!("No device could be started");
    }

    info!(
        "ectobus running with {}/{} device(s) on port(s) {:?}",
        coordinators.len(),
        config.modbus.devices.len(),
        registry.active_ports().await
    );

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    for coordinator in &coordinators {
        coordinator.shutdown();
    }
    for task in tasks {
        task.abort();
    }
    registry.close_all().await;

    info!("ectobus stopped");
    Ok(())
}

/// Open the device's link, identify it and start polling.
async fn start_device(
    registry: &LinkRegistry,
    device: &DeviceConfig,
    tables: &RegisterTables,
) -> Result<(CoordinatorHandle, JoinHandle<()>)> {
    let link = registry
        .acquire(&device.port, device.link_settings())
        .await
        .with_context(|| format!("Device '{}'", device.name))?;

    let (gateway, writer) =
        match DeviceGateway::create(Arc::clone(&link), device.slave_id, tables, device.read_timeout())
            .await
        {
            Ok(created) => created,
            Err(e) => {
                registry.release(&device.port).await;
                return Err(e).with_context(|| {
                    format!("Device '{}': slave {} not identified", device.name, device.slave_id)
                });
            }
        };

    let identity = gateway.identity();
    info!(
        device = %device.name,
        slave = device.slave_id,
        uid = %identity.uid_hex(),
        "Identified {}",
        identity.device_type
    );

    let handle = PollingCoordinator::spawn(&gateway, writer, device.coordinator_config());
    let task = tokio::spawn(log_events(device.name.clone(), gateway, handle.subscribe()));

    Ok((handle, task))
}

async fn log_events(
    name: String,
    gateway: DeviceGateway,
    mut events: broadcast::Receiver<CoordinatorEvent>,
) {
    loop {
        match events.recv().await {
            Ok(CoordinatorEvent::Updated) => log_state(&name, &gateway),
            Ok(CoordinatorEvent::UpdateFailed {
                consecutive_failures,
                error,
            }) => {
                warn!(device = %name, consecutive_failures, "Update failed: {}", error);
            }
            Ok(CoordinatorEvent::AvailabilityChanged { available }) => {
                info!(device = %name, available, "Availability changed");
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(device = %name, skipped, "Event logger lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn log_state(name: &str, gateway: &DeviceGateway) {
    match gateway {
        DeviceGateway::Boiler(boiler) => info!(
            device = %name,
            ch_temperature = ?boiler.ch_temperature(),
            dhw_temperature = ?boiler.dhw_temperature(),
            pressure = ?boiler.pressure(),
            modulation = ?boiler.modulation_level(),
            burner_on = ?boiler.burner_on(),
            main_error = ?boiler.main_error(),
            "Boiler updated"
        ),
        DeviceGateway::ContactSplitter(contacts) => {
            let states: Vec<String> = contacts
                .channel_states()
                .into_iter()
                .map(|(ch, state)| match state {
                    Some(state) => format!("{}={}", ch, state),
                    None => format!("{}=?", ch),
                })
                .collect();
            info!(device = %name, channels = %states.join(" "), "Contacts updated");
        }
    }
}
