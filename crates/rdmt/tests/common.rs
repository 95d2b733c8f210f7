//! Shared helpers for the engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use rdmt::{ConnId, ConnState, Engine, EngineEvent, RdmtConfig, SimFabric, SimNode};

pub const ADDR: &str = "sim:server";

pub fn config(max_connections: usize, bulk_size: usize) -> RdmtConfig {
    RdmtConfig {
        max_connections,
        bulk_size,
        ..RdmtConfig::default()
    }
}

pub fn engine(fabric: &SimFabric, name: &str, config: RdmtConfig) -> Engine<SimNode> {
    Engine::new(Arc::new(fabric.node(name)), config).unwrap()
}

pub fn server(fabric: &SimFabric, config: RdmtConfig) -> Engine<SimNode> {
    let mut server = engine(fabric, "server", config);
    server.listen(ADDR).unwrap();
    server
}

/// Runs every engine without blocking until nothing moves for a few rounds.
/// Returns the events each engine produced, in engine order.
pub fn pump(engines: &mut [&mut Engine<SimNode>]) -> Vec<Vec<EngineEvent>> {
    let mut events: Vec<Vec<EngineEvent>> = vec![Vec::new(); engines.len()];
    let mut quiet = 0;
    while quiet < 3 {
        let mut moved = false;
        for (i, engine) in engines.iter_mut().enumerate() {
            let outcome = engine.run_once(Duration::ZERO).unwrap();
            let taken = engine.take_events();
            moved |= outcome.events > 0 || outcome.completions > 0 || !taken.is_empty();
            events[i].extend(taken);
        }
        quiet = if moved { 0 } else { quiet + 1 };
    }
    events
}

/// Connects `client` to the server and returns both connection ids.
pub fn connect(server: &mut Engine<SimNode>, client: &mut Engine<SimNode>) -> (ConnId, ConnId) {
    let before = server.connections();
    let c = client.connect(ADDR).unwrap();
    pump(&mut [&mut *server, &mut *client]);
    assert_eq!(client.state(c), Some(ConnState::Established));
    let s = server
        .connections()
        .into_iter()
        .find(|id| !before.contains(id))
        .unwrap();
    assert_eq!(server.state(s), Some(ConnState::Established));
    (s, c)
}
