use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sipcore::auth::NonceTable;
use sipcore::cdr::CdrRecorder;
use sipcore::dialog::{DialogTable, InviteBranchTable, PendingRequestTable};
use sipcore::registrar::Registrar;
use sipcore::transport::udp::UdpTransport;
use sipcore::{Config, ConfigSnapshot, Engine};

#[derive(Parser, Debug)]
#[command(name = "proxyd", about = "RFC 3261 SIP proxy core")]
struct Args {
    /// Path to the TOML config file (without extension), e.g. `config/proxy`.
    #[arg(long, default_value = "proxy")]
    config: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_tracing_level().to_string())),
        )
        .init();

    let bind_addr = match config.bind_addr() {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = %e, "invalid bind address");
            std::process::exit(1);
        }
    };

    let transport = match UdpTransport::bind(bind_addr).await {
        Ok(t) => t,
        Err(e) => {
            error!(error = %e, "failed to bind UDP socket");
            std::process::exit(1);
        }
    };
    info!(%bind_addr, "listening");

    let sender = transport.sender();
    let (socket, _writer_handle) = transport.spawn_writer();

    let cdr = Arc::new(CdrRecorder::new(config.cdr_dir.clone(), config.cdr_merge_mode));
    let engine = Arc::new(Engine {
        config: Arc::new(ConfigSnapshot::new(config)),
        registrar: Arc::new(Registrar::new()),
        dialogs: Arc::new(DialogTable::new()),
        pending: Arc::new(PendingRequestTable::new()),
        invite_branches: Arc::new(InviteBranchTable::new()),
        cdr: cdr.clone(),
        nonces: Arc::new(NonceTable::new(Duration::from_secs(60))),
        sender,
    });

    let wheel = Arc::new(sipcore::timer::TimerWheel {
        registrar: engine.registrar.clone(),
        dialogs: engine.dialogs.clone(),
        pending: engine.pending.clone(),
        invite_branches: engine.invite_branches.clone(),
        cdr: engine.cdr.clone(),
        nonces: engine.nonces.clone(),
        tick: sipcore::timer::DEFAULT_TICK,
    });
    tokio::spawn(wheel.run());

    let dispatch_engine = engine.clone();
    let receive = tokio::spawn(async move {
        let result = UdpTransport::run_receive_loop(socket, move |inbound| {
            let engine = dispatch_engine.clone();
            async move {
                engine.on_datagram(&inbound.data, inbound.peer).await;
            }
        })
        .await;
        if let Err(e) = result {
            error!(error = %e, "receive loop terminated");
        }
    });

    tokio::select! {
        _ = receive => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down, flushing CDR");
        }
    }

    if let Err(e) = cdr.flush_all() {
        error!(error = %e, "failed to flush CDR on shutdown");
    }
}
