//! Host sniffing
//!
//! DOMAIN-* rules need a hostname, but IP-level flows only carry one inside
//! the first payload: the TLS ClientHello SNI on 443, the Host header on 80.
//! The flow manager feeds the first segment's payload through here before
//! classifying.

/// Ports worth delaying classification for when domain rules exist.
pub fn is_sniffable_port(port: u16) -> bool {
    port == 80 || port == 443
}

/// Extract a hostname from the first payload of a flow, dispatching on the
/// destination port.
pub fn sniff_host(payload: &[u8], dst_port: u16) -> Option<String> {
    match dst_port {
        443 => extract_sni(payload),
        80 => extract_http_host(payload),
        _ => None,
    }
}

/// Pull the server_name out of a TLS ClientHello.
///
/// Walks record header, handshake header, session id, cipher suites and
/// compression methods to reach the extension block, then scans for
/// extension type 0 (server_name) with name_type 0 (host_name).
pub fn extract_sni(payload: &[u8]) -> Option<String> {
    // TLS handshake record, any 3.x version
    if payload.len() < 6 || payload[0] != 0x16 || payload[1] != 0x03 {
        return None;
    }
    // handshake type: ClientHello
    if payload.get(5).copied() != Some(0x01) {
        return None;
    }

    // record header (5) + handshake header (4)
    let mut idx = 9usize;

    // client version (2) + random (32)
    if payload.len() < idx + 34 {
        return None;
    }
    idx += 34;

    // session id
    let sid_len = payload.get(idx).copied()? as usize;
    idx += 1 + sid_len;
    if payload.len() < idx + 2 {
        return None;
    }

    // cipher suites
    let cipher_len = u16::from_be_bytes([payload[idx], payload[idx + 1]]) as usize;
    idx += 2 + cipher_len;
    if payload.len() < idx + 1 {
        return None;
    }

    // compression methods
    let comp_len = payload[idx] as usize;
    idx += 1 + comp_len;
    if payload.len() < idx + 2 {
        return None;
    }

    // extensions
    let ext_len = u16::from_be_bytes([payload[idx], payload[idx + 1]]) as usize;
    idx += 2;
    let ext_end = idx.saturating_add(ext_len).min(payload.len());

    while idx + 4 <= ext_end {
        let ext_type = u16::from_be_bytes([payload[idx], payload[idx + 1]]);
        let ext_size = u16::from_be_bytes([payload[idx + 2], payload[idx + 3]]) as usize;
        idx += 4;
        if idx + ext_size > ext_end {
            break;
        }
        if ext_type == 0x00 && idx + 5 <= ext_end {
            let name_type = payload[idx + 2];
            let name_len = u16::from_be_bytes([payload[idx + 3], payload[idx + 4]]) as usize;
            if name_type == 0 && idx + 5 + name_len <= ext_end {
                if let Ok(host) = std::str::from_utf8(&payload[idx + 5..idx + 5 + name_len]) {
                    if !host.is_empty() {
                        return Some(host.to_ascii_lowercase());
                    }
                }
            }
        }
        idx += ext_size;
    }

    None
}

/// Pull the Host header out of a plaintext HTTP request head.
pub fn extract_http_host(payload: &[u8]) -> Option<String> {
    let head = std::str::from_utf8(payload).ok()?;

    // must at least look like a request line
    let mut lines = head.split("\r\n");
    let request_line = lines.next()?;
    if !request_line.contains(" HTTP/") {
        return None;
    }

    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.eq_ignore_ascii_case("host") {
            let host = value.trim();
            // strip an explicit port
            let host = host.split(':').next().unwrap_or(host);
            if !host.is_empty() {
                return Some(host.to_ascii_lowercase());
            }
        }
    }

    None
}
