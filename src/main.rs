#[macro_use]
extern crate dotenv_codegen;

use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

mod bridge;
mod codes;
mod control;
mod energy;
mod link;
mod modbus;
mod poller;
mod snapshot;

use anyhow::{Context, Result};
use bridge::Bridge;
use energy::EnergyStore;
use log::{error, info};

// Deployment settings from .env
const BIND_IP: &str = dotenv!("BIND_IP");
const INVERTER_PORT: &str = dotenv!("INVERTER_PORT");
const CONTROL_PORT: &str = dotenv!("CONTROL_PORT");
const ENERGY_STATE_PATH: &str = dotenv!("ENERGY_STATE_PATH");

const SAVE_INTERVAL: Duration = Duration::from_secs(300);

const VERSION: &str = env!("CARGO_PKG_VERSION");

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_signal: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Inverter bridge v{} starting", VERSION);

    // Bind both ports before any thread starts; an unusable port is fatal
    // and the supervisor restarts us.
    let inverter_addr = format!("{}:{}", BIND_IP, INVERTER_PORT);
    let inverter_listener = TcpListener::bind(&inverter_addr)
        .with_context(|| format!("bind inverter port {}", inverter_addr))?;
    let control_addr = format!("{}:{}", BIND_IP, CONTROL_PORT);
    let control_listener = TcpListener::bind(&control_addr)
        .with_context(|| format!("bind control port {}", control_addr))?;

    let bridge = Arc::new(Bridge::new(EnergyStore::load(ENERGY_STATE_PATH)));

    unsafe {
        libc::signal(libc::SIGTERM, request_shutdown as libc::sighandler_t);
        libc::signal(libc::SIGINT, request_shutdown as libc::sighandler_t);
    }

    let poller_bridge = bridge.clone();
    thread::spawn(move || poller::inverter_server(inverter_listener, poller_bridge));

    let control_bridge = bridge.clone();
    thread::spawn(move || control::control_server(control_listener, control_bridge));

    let mut last_save = Instant::now();
    while !SHUTDOWN.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_secs(1));
        if last_save.elapsed() >= SAVE_INTERVAL {
            save_energy(&bridge);
            last_save = Instant::now();
        }
    }

    info!("Shutdown requested, saving energy totals");
    save_energy(&bridge);
    Ok(())
}

fn save_energy(bridge: &Bridge) {
    if let Err(e) = bridge.energy.lock().unwrap().save() {
        error!("Energy state save failed, keeping in-memory totals: {:#}", e);
    }
}
