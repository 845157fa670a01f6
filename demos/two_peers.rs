use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use peerlink::{CommandHandler, CommandResult, Config, ExecMode, NodeId, NodeIdentity, Session};

/// Evaluates `a+b` integer expressions in place of a real host interpreter.
struct ArithmeticHandler;

impl CommandHandler for ArithmeticHandler {
    fn handle(&self, command: &str, _exec_mode: ExecMode, _unattended: bool) -> CommandResult {
        let mut parts = command.split('+');
        let lhs = parts.next().and_then(|p| p.trim().parse::<i64>().ok());
        let rhs = parts.next().and_then(|p| p.trim().parse::<i64>().ok());
        match (lhs, rhs) {
            (Some(lhs), Some(rhs)) => CommandResult::success((lhs + rhs).to_string()),
            _ => CommandResult::failure(vec![format!("cannot evaluate {:?}", command)]),
        }
    }
}

#[tokio::main]
async fn main() -> peerlink::Result<()> {
    tracing_subscriber::fmt::init();

    // Loopback-only configuration so the demo runs without a network.
    let config = Config {
        multicast_interface: Ipv4Addr::LOCALHOST,
        beacon_interval: Duration::from_millis(500),
        ..Config::default()
    };

    let mut node_a = Session::new(
        NodeIdentity::new("ue-a", "Editor A", IpAddr::V4(Ipv4Addr::LOCALHOST), 9001),
        config.clone(),
    );
    let mut node_b = Session::new(
        NodeIdentity::new("ue-b", "Editor B", IpAddr::V4(Ipv4Addr::LOCALHOST), 9002),
        config,
    );

    node_a.start(Arc::new(ArithmeticHandler)).await?;
    node_b.start(Arc::new(ArithmeticHandler)).await?;
    println!("Both nodes started, waiting for discovery...");

    let target = NodeId::new("ue-b");
    while !node_a.discovered_nodes().iter().any(|n| n.id == target) {
        sleep(Duration::from_millis(100)).await;
    }
    println!("ue-a discovered peers:");
    for peer in node_a.discovered_nodes() {
        println!("- {} ({}) at {}", peer.id, peer.display_name, peer.command_addr());
    }

    let channel = node_a.open_command_connection(&target).await?;
    let result = node_a
        .run_command(channel.as_ref(), "2+2", ExecMode::EvaluateStatement, None)
        .await?;
    println!("ue-b evaluated 2+2 -> {:?} (success: {})", result.output, result.success);

    node_a.stop().await;
    node_b.stop().await;
    println!("Done");
    Ok(())
}
