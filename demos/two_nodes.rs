//! Two local nodes bootstrap off each other, then look each other up.

use std::net::SocketAddrV4;
use std::time::Duration;

use xorline::{Config, Node};

fn main() -> xorline::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "xorline=debug".into()),
        )
        .init();

    let origin = Node::new(Config {
        port: Some(0),
        ..Default::default()
    })?;

    let origin_addr = SocketAddrV4::new([127, 0, 0, 1].into(), origin.local_addr().port());

    let joiner = Node::new(Config {
        port: Some(0),
        bootstrap: vec![origin_addr],
        cron_interval: Duration::from_millis(250),
        request_timeout: Duration::from_millis(500),
        ..Default::default()
    })?;

    std::thread::sleep(Duration::from_secs(2));

    println!("origin  {} knows {} peer(s)", origin.id(), origin.routing_table_size());
    println!("joiner  {} knows {} peer(s)", joiner.id(), joiner.routing_table_size());

    let found = joiner.lookup(origin.id());
    println!("lookup for the origin returned {} responder(s)", found.len());
    for peer in found {
        println!("  {} @ {}", peer.id(), peer.address());
    }

    joiner.shutdown();
    origin.shutdown();

    Ok(())
}
