//! Test server management.
//!
//! Spawns and manages `kvsyncd` instances for integration testing.

#![allow(dead_code)]

use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::Duration;
use tokio::time::sleep;

/// A test server instance: one `kvsyncd` child process bound to a fixed
/// port, with its own throwaway config file and data directory.
pub struct TestServer {
    child: Child,
    port: u16,
    data_dir: PathBuf,
}

impl TestServer {
    /// Spawn a new test server listening on `port`, hosting exactly the
    /// rooms named in `rooms`.
    pub async fn spawn(port: u16, rooms: &[&str]) -> anyhow::Result<Self> {
        let data_dir = std::env::temp_dir().join(format!("kvsyncd-test-{}", port));
        std::fs::create_dir_all(&data_dir)?;

        let mut room_blocks = String::new();
        for room in rooms {
            room_blocks.push_str(&format!("\n[rooms.{room}]\nresolution = \"lww\"\n"));
        }

        let config_path = data_dir.join("config.toml");
        let config_content = format!(
            r#"
[server]
name = "test.kvsyncd"
replica_id = {port}
metrics_port = 0

[listen]
address = "127.0.0.1:{port}"
{room_blocks}
"#,
        );

        std::fs::write(&config_path, config_content)?;

        let cargo_manifest_dir = env!("CARGO_MANIFEST_DIR");
        let binary_path = PathBuf::from(cargo_manifest_dir).join("target/debug/kvsyncd");

        let child = Command::new(&binary_path)
            .arg(config_path.to_str().unwrap())
            .spawn()?;

        let server = Self {
            child,
            port,
            data_dir,
        };

        server.wait_until_ready().await?;

        Ok(server)
    }

    /// Wait until the server is accepting connections.
    async fn wait_until_ready(&self) -> anyhow::Result<()> {
        for _ in 0..30 {
            if tokio::net::TcpStream::connect(("127.0.0.1", self.port))
                .await
                .is_ok()
            {
                return Ok(());
            }
            sleep(Duration::from_millis(100)).await;
        }
        anyhow::bail!("Server failed to start within 3 seconds")
    }

    /// The `ws://` URL for `room` on this server.
    pub fn sync_url(&self, room: &str) -> String {
        format!("ws://127.0.0.1:{}/sync/{}", self.port, room)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        let _ = std::fs::remove_dir_all(&self.data_dir);
    }
}
