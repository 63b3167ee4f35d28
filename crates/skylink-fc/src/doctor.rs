use crate::LinkConfig;

const SCHEMES: [&str; 7] = ["tcpin", "tcpout", "udpin", "udpout", "udpbcast", "serial", "file"];

/// Sanity checks on a vehicle link config. Returns the first problem found.
pub fn check_link(cfg: &LinkConfig) -> Result<(), String> {
    let (scheme, rest) = cfg
        .endpoint
        .split_once(':')
        .ok_or_else(|| format!("vehicle.endpoint {:?} has no scheme", cfg.endpoint))?;
    if !SCHEMES.contains(&scheme) {
        return Err(format!("vehicle.endpoint scheme {scheme:?} not one of {SCHEMES:?}"));
    }
    if rest.is_empty() {
        return Err("vehicle.endpoint has no address".into());
    }
    if scheme == "serial" && crate::mav::parse_serial(&cfg.endpoint).is_none() {
        return Err(format!("serial endpoint must be serial:<device>:<baud>, got {:?}", cfg.endpoint));
    }
    if cfg.connect_retries == 0 {
        return Err("vehicle.connect_retries must be >= 1".into());
    }
    if cfg.heartbeat_timeout_ms < 100 {
        return Err("vehicle.heartbeat_timeout_ms too small; set >= 100".into());
    }
    let s = &cfg.streams;
    for (key, hz) in [("position_hz", s.position_hz), ("attitude_hz", s.attitude_hz)] {
        if !(hz > 0.0 && hz <= 50.0) {
            return Err(format!("vehicle.streams.{key} should be in (0, 50], got {hz}"));
        }
    }
    if s.fallback_all_hz == 0 {
        return Err("vehicle.streams.fallback_all_hz must be >= 1".into());
    }
    if let Some(hz) = cfg.send_heartbeat_hz {
        if !(hz > 0.0 && hz <= 10.0) {
            return Err(format!("vehicle.send_heartbeat_hz should be in (0, 10], got {hz}"));
        }
    }
    Ok(())
}
