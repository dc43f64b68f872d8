use crate::config::Config;
use crate::device::DeviceLink;
use crate::dial::DialListener;
use crate::discovery::discover;
use crate::push::{PushManager, Subscription};
use crate::transport::Transport;
use std::net::SocketAddr;
use tokio::task::JoinHandle;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    if let Some(ref command) = std::env::args().nth(1) {
        if command == "config-init" {
            return handle_config_init();
        }
    }

    let config = Config::load()?;

    if let Some(ref command) = std::env::args().nth(1) {
        if command == "discover" {
            return handle_discover(&config).await;
        }
        return Err(format!("unknown command '{command}' (expected config-init or discover)").into());
    }

    let transport = Transport::from_config(&config.transport)?;
    let push = PushManager::new(config.push.clone(), transport.clone());
    push.set_discovery_callback(|beat| {
        tracing::info!(device = %beat.device_id, ip = %beat.from.ip(), "device announced itself");
    });

    let push_running = match config.devices.first() {
        Some(first) => push.start(first.ip_addr()?).await,
        None => {
            tracing::info!("no devices configured; push listener not started");
            false
        }
    };

    let mut subscriptions: Vec<Subscription> = Vec::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    for device in &config.devices {
        let ip = device.ip_addr()?;
        if push_running {
            let (subscription, mut updates) = push.subscribe_channel(&device.mac, ip);
            subscriptions.push(subscription);
            tasks.push(tokio::spawn(async move {
                while let Some(update) = updates.recv().await {
                    tracing::info!(
                        device = %update.device_id,
                        ip = %update.from.ip(),
                        state = ?update.state.state,
                        dimming = ?update.state.dimming,
                        scene = ?update.state.scene_id,
                        "pilot pushed"
                    );
                }
            }));
        } else {
            let link = DeviceLink::new(SocketAddr::new(ip, config.transport.device_port), transport.clone());
            tasks.push(tokio::spawn(poll_device(link, device.mac.clone(), config.push.renewal_interval())));
        }
    }

    if config.dial.enabled {
        match DialListener::bind(&config.dial).await {
            Ok(listener) => {
                let (listener_task, mut events) = listener.spawn();
                tasks.push(listener_task);
                tasks.push(tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        tracing::info!(
                            device = %event.device_id,
                            category = ?event.category,
                            sequence = event.sequence,
                            state = event.frame.state,
                            "dial event"
                        );
                    }
                }));
            }
            Err(err) => tracing::warn!(error = %err, "dial listener disabled"),
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown: ctrl-c");

    for subscription in subscriptions {
        subscription.unsubscribe().await;
    }
    push.stop().await;
    for task in tasks {
        task.abort();
    }
    Ok(())
}

/// Used when the push listener could not start.
async fn poll_device(link: DeviceLink, mac: String, period: std::time::Duration) {
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        match link.get_pilot().await {
            Ok(state) => tracing::info!(
                device = %mac,
                state = ?state.state,
                dimming = ?state.dimming,
                scene = ?state.scene_id,
                "pilot polled"
            ),
            Err(err) => tracing::warn!(device = %mac, target = %link.target(), error = %err, "poll failed"),
        }
    }
}

async fn handle_discover(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let schedule = config.transport.standard_schedule()?;
    let devices = discover(&config.discovery, config.transport.device_port, &schedule).await?;
    if devices.is_empty() {
        println!("no devices answered on {}", config.discovery.broadcast_address);
    }
    for device in devices {
        println!("{}\t{}", device.ip, device.mac);
    }
    Ok(())
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}
