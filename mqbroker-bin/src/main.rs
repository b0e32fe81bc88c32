#![deny(unsafe_code)]

use std::process;

use structopt::StructOpt;

use mqbroker::logger::logger_init;
use mqbroker::{MqttServer, Result, ServerContext};
use mqbroker_conf::{Listener as ListenerConf, Options, Settings};
use mqbroker_net::{Builder, Listener};

#[tokio::main]
async fn main() {
    //init config
    let settings = match Settings::init(Options::from_args()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("settings init failed, {:?}", e);
            process::exit(1);
        }
    };

    //init log
    if let Err(e) = logger_init(&settings.log) {
        eprintln!("logger init failed, {:?}", e);
        process::exit(1);
    }

    Settings::logs();

    if let Err(e) = serve(settings).await {
        log::error!("mqtt server failed, {:?}", e);
        process::exit(1);
    }
}

async fn serve(settings: &'static Settings) -> Result<()> {
    let scx = ServerContext::new().mqtt_max_sessions(settings.mqtt.max_sessions).build();
    let listener = bind(&settings.listener)?;
    MqttServer::new(scx).listener(listener).build().run(shutdown_signal()).await
}

fn bind(cfg: &ListenerConf) -> Result<Listener> {
    Builder::new()
        .name("external/tcp")
        .laddr(cfg.laddr())
        .backlog(cfg.backlog)
        .nodelay(cfg.nodelay)
        .reuseaddr(Some(cfg.reuseaddr))
        .max_connections(cfg.max_connections)
        .max_packet_size(cfg.max_packet_size.as_u32())
        .keepalive_backoff(cfg.keepalive_backoff)
        .max_inflight(cfg.max_inflight)
        .handshake_timeout(cfg.handshake_timeout)
        .send_timeout(cfg.send_timeout)
        .max_mqueue_len(cfg.max_mqueue_len)
        .max_clientid_len(cfg.max_clientid_len)
        .session_expiry_interval(cfg.session_expiry_interval)
        .message_retry_interval(cfg.message_retry_interval)
        .max_message_retries(cfg.max_message_retries)
        .bind()
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                log::warn!("install SIGTERM handler failed, {:?}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    log::info!("shutdown signal received");
}
