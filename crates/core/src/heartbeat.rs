//! Liveness record published to the broker.
//!
//! Wire shape: `{"src_name": "<hostname>", "status": "0", "pid": "<pid>"}`.
//! Both `status` and `pid` are strings on the wire.

use serde::{Serialize, Serializer};

/// Fallback when the hostname cannot be read.
const UNKNOWN_HOST: &str = "unknown";

/// Reported service status. Only `OK` exists; it is encoded as `"0"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HeartbeatStatus {
    #[serde(rename = "0")]
    Ok,
}

/// A point-in-time liveness record. Recomputed for every send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeartbeatRecord {
    pub src_name: String,
    pub status: HeartbeatStatus,
    #[serde(serialize_with = "serialize_as_string")]
    pub pid: u32,
}

impl HeartbeatRecord {
    /// Snapshot for the current process on this host.
    pub fn current() -> Self {
        Self {
            src_name: hostname(),
            status: HeartbeatStatus::Ok,
            pid: std::process::id(),
        }
    }

    /// JSON body for the heartbeat message.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn serialize_as_string<S: Serializer>(value: &u32, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

/// Host name of this machine, or `"unknown"` if it cannot be determined.
pub fn hostname() -> String {
    #[cfg(unix)]
    {
        let mut buf = [0u8; 256];
        // Safety: the buffer is valid for `buf.len()` bytes.
        let ret = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
        if ret == 0 {
            let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            let name = String::from_utf8_lossy(&buf[..end]).into_owned();
            if !name.is_empty() {
                return name;
            }
        }
    }

    std::env::var("HOSTNAME").unwrap_or_else(|_| UNKNOWN_HOST.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_serializes_status_and_pid_as_strings() {
        let record = HeartbeatRecord {
            src_name: "autoreduce1".to_string(),
            status: HeartbeatStatus::Ok,
            pid: 4242,
        };

        let json: serde_json::Value =
            serde_json::from_str(&record.to_json().expect("serialize")).expect("parse");

        assert_eq!(json["src_name"], "autoreduce1");
        assert_eq!(json["status"], "0");
        assert_eq!(json["pid"], "4242");
    }

    #[test]
    fn current_record_uses_this_process() {
        let record = HeartbeatRecord::current();

        assert_eq!(record.pid, std::process::id());
        assert_eq!(record.status, HeartbeatStatus::Ok);
        assert!(!record.src_name.is_empty());
    }
}
