// QMP monitor client for the shared qemu-storage-daemon.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        UnixStream,
        unix::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Mutex,
};
use tracing::{debug, info};

#[derive(Debug, Error)]
#[error("qmp error {class}: {desc}")]
pub struct QmpError {
    pub class: String,
    pub desc: String,
}

struct QmpConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// One monitor per daemon; the mutex serializes every command round-trip.
pub struct QmpMonitor {
    socket_path: PathBuf,
    conn: Mutex<Option<QmpConnection>>,
}

impl QmpMonitor {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            conn: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<QmpConnection> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| format!("failed to connect to {}", self.socket_path.display()))?;

        let (read_half, write_half) = stream.into_split();
        let mut conn = QmpConnection {
            reader: BufReader::new(read_half),
            writer: write_half,
        };

        // the monitor greets with {"QMP": {...}} before accepting commands
        let greeting = read_line(&mut conn.reader).await?;
        if greeting.get("QMP").is_none() {
            bail!("unexpected qmp greeting: {greeting}");
        }

        write_line(&mut conn.writer, &json!({"execute": "qmp_capabilities"})).await?;
        loop {
            let response = read_line(&mut conn.reader).await?;
            if let Some(event) = response.get("event") {
                info!("qmp event: {event}");
                continue;
            }
            if response.get("return").is_some() {
                break;
            }
            if let Some(error) = response.get("error") {
                return Err(qmp_error(error).into());
            }
        }

        Ok(conn)
    }

    pub async fn execute(&self, command: &str, arguments: Option<Value>) -> Result<Value> {
        let mut guard = self.conn.lock().await;

        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let conn = guard.as_mut().expect("connection just established");

        let mut request = json!({"execute": command});
        if let Some(arguments) = arguments {
            request["arguments"] = arguments;
        }

        let result = async {
            write_line(&mut conn.writer, &request).await?;
            loop {
                let response = read_line(&mut conn.reader).await?;
                if let Some(event) = response.get("event") {
                    info!("qmp event: {event}");
                    continue;
                }
                if let Some(value) = response.get("return") {
                    debug!("qmp {command} returned");
                    return Ok(value.clone());
                }
                if let Some(error) = response.get("error") {
                    return Err(qmp_error(error).into());
                }
            }
        }
        .await;

        // a broken stream poisons the connection, reconnect on the next call
        if result
            .as_ref()
            .is_err_and(|err: &anyhow::Error| err.downcast_ref::<QmpError>().is_none())
        {
            *guard = None;
        }

        result
    }

    pub async fn query_named_block_nodes(&self) -> Result<Vec<BlockNode>> {
        let value = self.execute("query-named-block-nodes", None).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn query_block_exports(&self) -> Result<Vec<BlockExport>> {
        let value = self.execute("query-block-exports", None).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn blockdev_add(&self, arguments: BlockdevAddArguments) -> Result<()> {
        self.execute("blockdev-add", Some(serde_json::to_value(arguments)?))
            .await?;
        Ok(())
    }

    pub async fn blockdev_del(&self, node_name: &str) -> Result<()> {
        self.execute("blockdev-del", Some(json!({"node-name": node_name})))
            .await?;
        Ok(())
    }

    pub async fn block_export_add(&self, arguments: BlockExportAddArguments) -> Result<()> {
        self.execute("block-export-add", Some(serde_json::to_value(arguments)?))
            .await?;
        Ok(())
    }

    pub async fn block_export_del(&self, id: &str) -> Result<()> {
        self.execute("block-export-del", Some(json!({"id": id}))).await?;
        Ok(())
    }
}

fn qmp_error(error: &Value) -> QmpError {
    QmpError {
        class: error
            .get("class")
            .and_then(Value::as_str)
            .unwrap_or("GenericError")
            .to_string(),
        desc: error
            .get("desc")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

async fn read_line(reader: &mut BufReader<OwnedReadHalf>) -> Result<Value> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        bail!("qmp monitor closed the connection");
    }
    Ok(serde_json::from_str(&line).with_context(|| format!("malformed qmp frame: {line:?}"))?)
}

async fn write_line(writer: &mut OwnedWriteHalf, value: &Value) -> Result<()> {
    let mut frame = serde_json::to_vec(value)?;
    frame.push(b'\n');
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockNode {
    #[serde(rename = "node-name")]
    pub node_name: String,
    #[serde(default)]
    pub drv: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockExport {
    pub id: String,
    #[serde(rename = "node-name", default)]
    pub node_name: String,
    #[serde(rename = "type", default)]
    pub export_type: String,
    #[serde(rename = "shutting-down", default)]
    pub shutting_down: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockdevAddArguments {
    #[serde(rename = "node-name")]
    pub node_name: String,
    pub driver: String,
    pub pool: String,
    pub image: String,
    pub user: String,
    pub conf: String,
    pub discard: String,
    pub cache: BlockdevCache,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockdevCache {
    pub direct: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockExportAddArguments {
    pub id: String,
    #[serde(rename = "node-name")]
    pub node_name: String,
    #[serde(rename = "type")]
    pub export_type: String,
    pub addr: BlockExportAddr,
    pub writable: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockExportAddr {
    #[serde(rename = "type")]
    pub addr_type: String,
    pub path: String,
}


#[cfg(test)]
mod tests {
    use super::{fake::FakeStorageDaemon, *};

    #[tokio::test]
    async fn test_monitor_roundtrip() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let socket = dir.path().join("qmp.sock");
        let daemon = FakeStorageDaemon::start(&socket).await;

        let monitor = QmpMonitor::new(&socket);

        let nodes = monitor
            .query_named_block_nodes()
            .await
            .expect("failed to query nodes");
        assert!(nodes.is_empty());

        monitor
            .blockdev_add(BlockdevAddArguments {
                node_name: "ceph-abc".into(),
                driver: "rbd".into(),
                pool: "pool".into(),
                image: "image".into(),
                user: "admin".into(),
                conf: "/conf/ceph.conf".into(),
                discard: "unmap".into(),
                cache: BlockdevCache { direct: true },
            })
            .await
            .expect("failed to add blockdev");

        let nodes = monitor
            .query_named_block_nodes()
            .await
            .expect("failed to query nodes");
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].node_name, "ceph-abc");

        monitor
            .block_export_add(BlockExportAddArguments {
                id: "ceph-abc".into(),
                node_name: "ceph-abc".into(),
                export_type: "vhost-user-blk".into(),
                addr: BlockExportAddr {
                    addr_type: "unix".into(),
                    path: "/x/socket".into(),
                },
                writable: true,
            })
            .await
            .expect("failed to add export");

        let exports = monitor
            .query_block_exports()
            .await
            .expect("failed to query exports");
        assert_eq!(exports.len(), 1);

        monitor
            .block_export_del("ceph-abc")
            .await
            .expect("failed to delete export");
        monitor
            .blockdev_del("ceph-abc")
            .await
            .expect("failed to delete blockdev");

        // a second delete surfaces the daemon error
        let err = monitor
            .blockdev_del("ceph-abc")
            .await
            .expect_err("expected qmp error");
        assert!(err.downcast_ref::<QmpError>().is_some());

        drop(daemon);
    }
}
