//! Foreign boundary
//!
//! Process-wide singleton behind a single mutex. The host's tunnel-read
//! thread, poll thread and control plane all enter here; the lock serializes
//! them for the duration of each call. Upstream I/O never runs under this
//! lock (see the flow manager).

use std::net::IpAddr;
use std::sync::Mutex;

use crate::config::EngineConfig;
use crate::engine::PassageCore;
use crate::error::{PassageError, Result};
use crate::rule::RouteAction;
use crate::stats::EngineStats;

static ENGINE: Mutex<Option<PassageCore>> = Mutex::new(None);

fn lock_engine() -> std::sync::MutexGuard<'static, Option<PassageCore>> {
    match ENGINE.lock() {
        Ok(guard) => guard,
        // recover the guard if a holder panicked
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn with_engine<T>(f: impl FnOnce(&mut PassageCore) -> Result<T>) -> Result<T> {
    let mut guard = lock_engine();
    match guard.as_mut() {
        Some(core) => f(core),
        None => Err(PassageError::NotInitialized),
    }
}

/// Initialize the engine. Fails with AlreadyInitialized while a live
/// instance exists.
pub fn init_core(
    server_host: String,
    server_port: u16,
    username: Option<String>,
    password: Option<String>,
) -> Result<()> {
    let mut config = EngineConfig::new(server_host, server_port);
    if let (Some(user), Some(pass)) = (username, password) {
        config = config.with_auth(user, pass);
    }

    let mut guard = lock_engine();
    if guard.is_some() {
        return Err(PassageError::AlreadyInitialized);
    }

    *guard = Some(PassageCore::new(config)?);
    log::info!("passage core initialized");
    Ok(())
}

/// Initialize with a full configuration record.
pub fn init_core_with_config(config: EngineConfig) -> Result<()> {
    let mut guard = lock_engine();
    if guard.is_some() {
        return Err(PassageError::AlreadyInitialized);
    }

    *guard = Some(PassageCore::new(config)?);
    log::info!("passage core initialized");
    Ok(())
}

/// Tear the engine down: RST every TCP flow, cancel upstream I/O, empty the
/// queues and reset stats. After this `is_initialized()` is false and a
/// fresh `init_core` is permitted.
pub fn shutdown_core() -> Result<()> {
    let mut guard = lock_engine();
    match guard.take() {
        Some(mut core) => {
            core.shutdown();
            log::info!("passage core shut down");
            Ok(())
        }
        None => Err(PassageError::NotInitialized),
    }
}

pub fn is_initialized() -> bool {
    lock_engine().is_some()
}

/// Push one datagram read from the tunnel; returns any immediately
/// emittable response packets.
pub fn process_inbound_packet(packet: Vec<u8>) -> Result<Vec<Vec<u8>>> {
    with_engine(|core| core.process_inbound(&packet))
}

/// Push one platform-bound packet through the tx funnel; returns the
/// drained batch.
pub fn process_outbound_packet(packet: Vec<u8>) -> Result<Vec<Vec<u8>>> {
    with_engine(|core| core.process_outbound(&packet))
}

/// Advance timers and state machines. The host calls this at >= 20 Hz.
pub fn poll_core() -> Result<()> {
    with_engine(|core| {
        core.poll();
        Ok(())
    })
}

/// Drain every packet waiting for the platform.
pub fn get_outbound_packets() -> Result<Vec<Vec<u8>>> {
    with_engine(|core| Ok(core.take_outbound()))
}

/// Replace the rule table; returns the count of accepted rules.
pub fn load_rules(text: String) -> Result<u32> {
    with_engine(|core| {
        let report = core.load_rules(&text);
        Ok(report.accepted as u32)
    })
}

/// Classify a prospective connection.
pub fn evaluate_route(
    domain: Option<String>,
    ip: Option<String>,
    port: Option<u16>,
    _proto: Option<u8>,
) -> Result<RouteAction> {
    with_engine(|core| {
        let parsed_ip: Option<IpAddr> = ip.as_deref().and_then(|s| s.parse().ok());
        Ok(core.evaluate_route(domain.as_deref(), parsed_ip, port.unwrap_or(0)))
    })
}

pub fn get_stats() -> Result<EngineStats> {
    with_engine(|core| Ok(core.get_stats()))
}

pub fn enable_proxy() -> Result<()> {
    with_engine(|core| {
        core.enable_proxy();
        Ok(())
    })
}

pub fn disable_proxy() -> Result<()> {
    with_engine(|core| {
        core.disable_proxy();
        Ok(())
    })
}

pub fn is_proxy_enabled() -> Result<bool> {
    with_engine(|core| Ok(core.is_proxy_enabled()))
}

pub fn rule_count() -> Result<u32> {
    with_engine(|core| Ok(core.rule_count() as u32))
}

/// Engine version, always available.
pub fn get_core_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// ASCII control channel for hosts that embed the engine behind a text
/// pipe. `getStats` answers JSON; everything else answers plain strings.
/// `reloadRules` takes the rule text on the lines after the verb.
pub fn handle_control(message: &str) -> Result<String> {
    let (verb, rest) = match message.split_once('\n') {
        Some((first, rest)) => (first.trim(), rest),
        None => (message.trim(), ""),
    };

    match verb {
        "getStats" => with_engine(|core| Ok(core.get_stats().to_json())),
        "getVersion" => Ok(get_core_version()),
        "reloadRules" => with_engine(|core| {
            let report = core.load_rules(rest);
            Ok(report.accepted.to_string())
        }),
        _ if verb.starts_with("route:") => {
            let target = verb.trim_start_matches("route:").trim();
            let (host, port) = match target.rsplit_once(':') {
                Some((h, p)) => (h, p.parse::<u16>().unwrap_or(443)),
                None => (target, 443),
            };
            with_engine(|core| {
                let action = match host.parse::<IpAddr>() {
                    Ok(ip) => core.evaluate_route(None, Some(ip), port),
                    Err(_) => core.evaluate_route(Some(host), None, port),
                };
                Ok(action.to_string())
            })
        }
        other => Err(PassageError::InvalidConfig(format!(
            "unknown control command: {}",
            other
        ))),
    }
}
