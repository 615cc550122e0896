//! 📡 The memcached backend - text protocol, one TCP connection, no drama.
//!
//! `set_many` pipelines the whole batch in one write:
//!
//! ```text
//! set <key> 0 0 <len>\r\n<payload>\r\n     (× batch size)
//! ```
//!
//! then reads one reply line per request, in order. `STORED` is a yes.
//! `NOT_STORED`, `SERVER_ERROR ...`, `CLIENT_ERROR ...` and friends are a
//! no for that key only. A timeout, EOF or socket error is a no for the
//! whole connection, and the caller should go get a new one.
//!
//! ⏱️ Every network step (connect, write, each reply) gets its own timeout.
//! We will wait, but not forever.

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{trace, warn};

use crate::backends::Store;
use crate::common::Batch;

// 📏 memcached's own limit; longer keys get CLIENT_ERROR and a desynced stream
const MAX_KEY_LEN: usize = 250;

#[derive(Debug)]
pub(crate) struct MemcachedStore {
    endpoint: String,
    stream: BufReader<TcpStream>,
    timeout: Duration,
}

impl MemcachedStore {
    /// 🔌 Open a TCP connection to `endpoint` (`host:port`) within `timeout`.
    pub(crate) async fn connect(endpoint: &str, connect_timeout: Duration) -> Result<Self> {
        let stream = timeout(connect_timeout, TcpStream::connect(endpoint))
            .await
            .context(format!(
                "💀 memcached at {endpoint} did not pick up within {connect_timeout:?}"
            ))?
            .context(format!("💀 Could not connect to memcached at {endpoint}"))?;
        // -- 🏎️ small requests, latency matters more than packet count
        stream
            .set_nodelay(true)
            .context("💀 Could not set TCP_NODELAY on the memcached socket")?;
        trace!("🔌 connected to memcached at {}", endpoint);
        Ok(Self {
            endpoint: endpoint.to_string(),
            stream: BufReader::new(stream),
            timeout: connect_timeout,
        })
    }

    async fn read_reply(&mut self) -> Result<String> {
        let mut line = String::new();
        let bytes_read = timeout(self.timeout, self.stream.read_line(&mut line))
            .await
            .context(format!(
                "💀 memcached at {} went quiet for {:?} mid-batch",
                self.endpoint, self.timeout
            ))?
            .context(format!("💀 Failed reading a reply from memcached at {}", self.endpoint))?;
        if bytes_read == 0 {
            bail!("💀 memcached at {} closed the connection mid-batch", self.endpoint);
        }
        Ok(line.trim_end().to_string())
    }
}

/// 🔑 Keys memcached will accept without choking: 1..=250 bytes, no spaces or control chars.
pub(crate) fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key.bytes().all(|b| b > b' ' && b != 0x7f)
}

#[async_trait]
impl Store for MemcachedStore {
    async fn set_many(&mut self, batch: &Batch) -> Result<BTreeSet<String>> {
        let mut failed = BTreeSet::new();
        let mut sent = Vec::with_capacity(batch.len());
        let mut request = Vec::with_capacity(batch.total_bytes() + batch.len() * 64);

        for (key, payload) in batch.iter() {
            if !is_valid_key(key) {
                warn!("🔑 memcached at {} cannot store key `{}`, skipping it", self.endpoint, key);
                failed.insert(key.to_string());
                continue;
            }
            request.extend_from_slice(format!("set {} 0 0 {}\r\n", key, payload.len()).as_bytes());
            request.extend_from_slice(payload);
            request.extend_from_slice(b"\r\n");
            sent.push(key);
        }

        if sent.is_empty() {
            return Ok(failed);
        }

        timeout(self.timeout, self.stream.get_mut().write_all(&request))
            .await
            .context(format!(
                "💀 Writing {} bytes to memcached at {} took longer than {:?}",
                request.len(),
                self.endpoint,
                self.timeout
            ))?
            .context(format!("💀 Cannot write to memcached at {}", self.endpoint))?;

        for key in sent {
            let reply = self.read_reply().await?;
            if reply != "STORED" {
                trace!("🙅 memcached at {} said `{}` for {}", self.endpoint, reply, key);
                failed.insert(key.to_string());
            }
        }
        Ok(failed)
    }

    async fn close(&mut self) -> Result<()> {
        self.stream
            .get_mut()
            .shutdown()
            .await
            .context(format!("💀 Failed to close the connection to memcached at {}", self.endpoint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// 🎭 A tiny memcached impersonator: answers `set` with STORED, except for
    /// keys in `grumpy_about`, which get NOT_STORED. Returns the address and a
    /// handle resolving to every key it was asked to set.
    async fn fake_memcached(
        grumpy_about: Vec<String>,
    ) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("💀 bind a local port");
        let address = listener.local_addr().expect("💀 local addr").to_string();
        let handle = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("💀 accept");
            let mut reader = BufReader::new(socket);
            let mut seen = Vec::new();
            loop {
                let mut header = String::new();
                if reader.read_line(&mut header).await.expect("💀 read header") == 0 {
                    return seen;
                }
                let parts: Vec<&str> = header.split_whitespace().collect();
                let key = parts[1].to_string();
                let len: usize = parts[4].parse().expect("💀 length");
                let mut body = vec![0u8; len + 2];
                reader.read_exact(&mut body).await.expect("💀 read body");
                let reply: &[u8] = if grumpy_about.contains(&key) {
                    b"NOT_STORED\r\n"
                } else {
                    b"STORED\r\n"
                };
                reader.get_mut().write_all(reply).await.expect("💀 reply");
                seen.push(key);
            }
        });
        (address, handle)
    }

    fn batch(keys: &[&str]) -> Batch {
        let mut batch = Batch::with_capacity(keys.len());
        for key in keys {
            batch.insert(key.to_string(), vec![0x08, 0x01, b'\r', b'\n']);
        }
        batch
    }

    #[tokio::test]
    async fn the_one_where_memcached_stores_most_things() {
        let (address, server) = fake_memcached(vec!["gaid:grumpy".to_string()]).await;
        let mut store = MemcachedStore::connect(&address, Duration::from_secs(1))
            .await
            .expect("💀 connect to the impersonator");

        let failed = store
            .set_many(&batch(&["gaid:1", "gaid:grumpy", "gaid:2"]))
            .await
            .expect("💀 set_many should not error");
        assert_eq!(failed, BTreeSet::from(["gaid:grumpy".to_string()]));

        store.close().await.expect("💀 close");
        let mut seen = server.await.expect("💀 server task");
        seen.sort();
        assert_eq!(seen, vec!["gaid:1", "gaid:2", "gaid:grumpy"]);
    }

    #[tokio::test]
    async fn the_one_where_unstorable_keys_never_leave_the_building() {
        let (address, server) = fake_memcached(vec![]).await;
        let mut store = MemcachedStore::connect(&address, Duration::from_secs(1))
            .await
            .expect("💀 connect");

        let failed = store
            .set_many(&batch(&["idfa:has space", "idfa:fine"]))
            .await
            .expect("💀 set_many");
        assert_eq!(failed, BTreeSet::from(["idfa:has space".to_string()]));

        store.close().await.expect("💀 close");
        assert_eq!(server.await.expect("💀 server task"), vec!["idfa:fine"]);
    }

    #[tokio::test]
    async fn the_one_where_memcached_goes_quiet_and_we_stop_waiting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("💀 bind");
        let address = listener.local_addr().expect("💀 addr").to_string();
        let server = tokio::spawn(async move {
            // -- 🤐 accept, swallow the request, never say a word
            let (mut socket, _) = listener.accept().await.expect("💀 accept");
            let mut sink = vec![0u8; 1024];
            let _ = socket.read(&mut sink).await;
            tokio::time::sleep(Duration::from_secs(10)).await;
        });
        let patience = Duration::from_millis(300);
        let mut store = MemcachedStore::connect(&address, patience)
            .await
            .expect("💀 connect");

        let started = std::time::Instant::now();
        let result = store.set_many(&batch(&["idfa:1"])).await;
        let waited = started.elapsed();

        assert!(result.is_err());
        assert!(waited >= patience);
        assert!(waited < patience * 5, "💀 waited {waited:?}, the timeout should have kicked in");
        server.abort();
    }

    #[tokio::test]
    async fn the_one_where_memcached_hangs_up_mid_batch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("💀 bind");
        let address = listener.local_addr().expect("💀 addr").to_string();
        let server = tokio::spawn(async move {
            // -- 📞 read exactly one request, then hang up without a reply
            let (socket, _) = listener.accept().await.expect("💀 accept");
            let mut reader = BufReader::new(socket);
            let mut header = String::new();
            reader.read_line(&mut header).await.expect("💀 read header");
            let len: usize = header
                .split_whitespace()
                .nth(4)
                .expect("💀 length field")
                .parse()
                .expect("💀 length");
            let mut body = vec![0u8; len + 2];
            reader.read_exact(&mut body).await.expect("💀 read body");
        });
        let mut store = MemcachedStore::connect(&address, Duration::from_secs(2))
            .await
            .expect("💀 connect");

        let result = store.set_many(&batch(&["idfa:1"])).await;
        server.await.expect("💀 server task");

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn the_one_where_nobody_is_home() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("💀 bind");
        let address = listener.local_addr().expect("💀 addr").to_string();
        drop(listener);
        assert!(MemcachedStore::connect(&address, Duration::from_millis(500)).await.is_err());
    }

    #[test]
    fn the_one_where_key_rules_are_memcached_rules() {
        assert!(is_valid_key("idfa:1rfw452y52g2gq4g"));
        assert!(!is_valid_key(""));
        assert!(!is_valid_key("idfa:with space"));
        assert!(!is_valid_key("idfa:new\nline"));
        assert!(!is_valid_key(&"k".repeat(251)));
    }
}
