//! Request signing.
//!
//! Every authenticated connection presents a SigV4 string-to-sign and
//! signature computed over the fixed service endpoint URL. The derivation is
//! deterministic given the credentials and timestamp.

use std::time::{SystemTime, UNIX_EPOCH};

use kestrel_common::Credentials;
use sha2::Digest;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SIGNING_NAME: &str = "dax";

fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    const BLOCK: usize = 64;
    let mut key_block = [0u8; BLOCK];
    if key.len() > BLOCK {
        let mut h = sha2::Sha256::new();
        h.update(key);
        key_block[..32].copy_from_slice(&h.finalize());
    } else {
        key_block[..key.len()].copy_from_slice(key);
    }
    let mut ipad = [0x36u8; BLOCK];
    let mut opad = [0x5cu8; BLOCK];
    for i in 0..BLOCK {
        ipad[i] ^= key_block[i];
        opad[i] ^= key_block[i];
    }
    let mut inner = sha2::Sha256::new();
    inner.update(ipad);
    inner.update(message);
    let inner = inner.finalize();
    let mut outer = sha2::Sha256::new();
    outer.update(opad);
    outer.update(inner);
    outer.finalize().into()
}

fn sha256_hex(data: &[u8]) -> String {
    let mut h = sha2::Sha256::new();
    h.update(data);
    hex(&h.finalize())
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Convert days since the Unix epoch into (year, month, day).
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

/// `YYYYMMDD` and `YYYYMMDDTHHMMSSZ` stamps for a signing time.
fn timestamps(now: SystemTime) -> (String, String) {
    let secs = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    let (days, rem) = (secs.div_euclid(86_400), secs.rem_euclid(86_400));
    let (y, m, d) = civil_from_days(days);
    let (hh, mm, ss) = (rem / 3600, (rem % 3600) / 60, rem % 60);
    let date = format!("{y:04}{m:02}{d:02}");
    let stamp = format!("{date}T{hh:02}{mm:02}{ss:02}Z");
    (date, stamp)
}

fn host_of(endpoint_url: &str) -> &str {
    let rest = endpoint_url
        .split_once("://")
        .map(|(_, r)| r)
        .unwrap_or(endpoint_url);
    rest.split(['/', ':']).next().unwrap_or(rest)
}

/// Derive the SigV4 string-to-sign and signature for an auth frame.
pub fn generate_sig_v4(
    credentials: &Credentials,
    endpoint_url: &str,
    region: &str,
    payload: &str,
    now: SystemTime,
) -> (String, String) {
    let (date, stamp) = timestamps(now);
    let host = host_of(endpoint_url);

    let canonical_request = format!(
        "POST\n/\n\nhost:{host}\n\nhost\n{}",
        sha256_hex(payload.as_bytes())
    );
    let scope = format!("{date}/{region}/{SIGNING_NAME}/aws4_request");
    let string_to_sign = format!(
        "{ALGORITHM}\n{stamp}\n{scope}\n{}",
        sha256_hex(canonical_request.as_bytes())
    );

    let secret = format!("AWS4{}", credentials.secret_access_key);
    let k_date = hmac_sha256(secret.as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, SIGNING_NAME.as_bytes());
    let k_signing = hmac_sha256(&k_service, b"aws4_request");
    let signature = hex(&hmac_sha256(&k_signing, string_to_sign.as_bytes()));

    (string_to_sign, signature)
}
