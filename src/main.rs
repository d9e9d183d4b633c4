use jsonrpsee::server::Server;
use mnbft::chain::{ChainReader, MemChain};
use mnbft::config::{ConsensusConfig, PERIODIC_JOB_PERIOD};
use mnbft::consensus::BftEngine;
use mnbft::countdown::{self, CountdownTimer};
use mnbft::network::{Network, NetworkEvent};
use mnbft::rpc::{BftRpcImpl, BftRpcServer};
use mnbft::types::{Address, QuorumCert, Round};
use std::env;
use std::sync::Arc;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // 1. Args: <node_id> [--config <path>] [--validators <n>]
    let args: Vec<String> = env::args().collect();
    let id_arg = args
        .get(1)
        .ok_or("Usage: mnbft <node_id> [--config <path>] [--validators <n>]")?
        .parse::<u64>()?;

    let option = |name: &str| {
        args.iter()
            .position(|a| a == name)
            .and_then(|pos| args.get(pos + 1))
    };

    let config = match option("--config") {
        Some(path) => {
            log::info!("Loading consensus config from {}", path);
            ConsensusConfig::from_file(path)?
        }
        None => ConsensusConfig::default(),
    };
    let validators = match option("--validators") {
        Some(n) => n.parse::<u64>()?,
        None => 5,
    };

    // 2. Keys and the in-memory chain
    let (_, my_key) = mnbft::crypto::generate_keypair_from_id(id_arg);
    let masternodes: Vec<Address> = (0..validators)
        .map(|i| mnbft::crypto::generate_keypair_from_id(i).0.address())
        .collect();
    let chain = MemChain::new(masternodes, config.epoch);
    let genesis = QuorumCert::genesis(chain.current_header().block_info());

    // 3. Engine, broadcast channel and countdown timer
    let (broadcaster, mut outbound) = mpsc::unbounded_channel();
    let (timer_handle, timer_commands) = countdown::channel();
    let engine = Arc::new(BftEngine::new(
        config,
        my_key,
        Arc::new(chain.clone()),
        Arc::new(chain.clone()),
        broadcaster,
        timer_handle.clone(),
        genesis,
    ));
    log::info!("Node {} signing as {}", id_arg, engine.signer());

    let timer_engine = engine.clone();
    let timer_chain = chain.clone();
    let timer = CountdownTimer::new(
        timer_commands,
        Arc::new(move |round: Round| {
            log::debug!("Countdown fired for round {}", round);
            if let Err(e) = timer_engine.on_countdown_timeout(&timer_chain) {
                log::error!("Countdown timeout handling failed: {}", e);
            }
        }),
    )
    .spawn();

    let hygiene = engine.spawn_periodic_hygiene(PERIODIC_JOB_PERIOD);

    // 4. RPC server
    let rpc_port = 8545 + id_arg as u16;
    let addr = format!("127.0.0.1:{}", rpc_port);
    let server = Server::builder().build(addr).await?;
    let handle = server.start(BftRpcImpl::new(engine.clone()).into_rpc());
    log::info!("RPC Server started on port {}", rpc_port);

    // 5. Network: node 0 listens on 9000, others dial it
    let port = if id_arg == 0 { 9000 } else { 0 };
    let mut network = Network::new(port).await?;
    if id_arg != 0 {
        log::info!("Dialing bootnode...");
        network.dial("/ip4/127.0.0.1/tcp/9000").await;
    }

    let mut consensus_started = false;

    // 6. Main event loop
    loop {
        tokio::select! {
            Some(message) = outbound.recv() => {
                network.broadcast(&message).await;
            }
            Some(event) = network.next_event() => match event {
                NetworkEvent::PeerConnected(peer) => {
                    log::info!("Peer connected: {}", peer);
                    if !consensus_started {
                        log::info!("Starting consensus at round {}", engine.current_round());
                        consensus_started = true;
                        engine.start();
                    }
                }
                NetworkEvent::MessageReceived(message) => {
                    let engine = engine.clone();
                    let chain = chain.clone();
                    // Handlers verify signatures under the engine lock.
                    let result = tokio::task::spawn_blocking(move || {
                        engine.handle_message(&chain, message)
                    })
                    .await;
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => log::warn!("Dropped consensus message: {}", e),
                        Err(e) => log::error!("Message handler panicked: {:?}", e),
                    }
                }
            },
            _ = tokio::signal::ctrl_c() => {
                log::info!("Shutdown signal received. Stopping RPC server...");
                let _ = handle.stop();
                handle.stopped().await;
                log::info!("Shutting down Node {}...", id_arg);
                break;
            }
        }
    }

    timer_handle.stop();
    hygiene.abort();
    let _ = timer.await;
    log::info!("Node {} shutdown complete.", id_arg);
    Ok(())
}
