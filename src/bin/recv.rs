//! SOM 수신 데모 - SSE over MIDI
//!
//! UDP로 들어오는 UMP 패킷을 재조립해 SSE 엔벨로프를 출력함
//! - 갭 감지 시 자동으로 NACK을 보내고 재전송을 수신
//!
//! 사용법:
//!   cargo run --release --bin som-recv -- [OPTIONS]
//!
//! 예시:
//!   cargo run --release --bin som-recv -- --bind 127.0.0.1:7000

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use som::{Config, JrClock, Metrics, Reliability, RtpMidiConfig, RtpMidiSession, SseReceiver};

/// 수신 데모 설정
struct RecvConfig {
    bind_addr: SocketAddr,
}

impl Default for RecvConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7000".parse().unwrap(),
        }
    }
}

fn parse_args() -> RecvConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = RecvConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    config.bind_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!(
                    r#"som-recv - SSE over MIDI 수신 데모

UDP로 들어오는 MIDI 2.0 UMP 패킷을 재조립해 SSE 엔벨로프를 출력

사용법:
  cargo run --release --bin som-recv -- [OPTIONS]

옵션:
  -b, --bind <ADDR>      바인드 주소 (기본: 127.0.0.1:7000)
  -h, --help             이 도움말 출력
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = parse_args();

    info!("som-recv 시작: {}", args.bind_addr);

    let protocol = Config::default();
    let session_config = RtpMidiConfig::from_config("som-recv", args.bind_addr, &protocol);
    let transport = Arc::new(RtpMidiSession::new(session_config));

    let metrics = Arc::new(Metrics::new());
    let receiver = SseReceiver::new(
        transport.clone(),
        Arc::new(Mutex::new(Reliability::with_capacity(
            protocol.retransmit_buffer_cap,
            metrics.clone(),
        ))),
        metrics.clone(),
        Arc::new(JrClock::new()),
        protocol,
    );

    receiver.subscribe_event(Arc::new(|env, wall| {
        let age = wall
            .and_then(|w| SystemTime::now().duration_since(w).ok())
            .map(|d| format!("{:.1}ms 전", d.as_secs_f64() * 1000.0))
            .unwrap_or_else(|| "시각 없음".into());
        info!(
            "seq={} ev={} id={:?} data={:?} ({})",
            env.seq, env.ev, env.id, env.data, age
        );
    }));

    receiver.start().await?;
    info!("수신 대기 중 (Ctrl-C로 종료)");

    tokio::signal::ctrl_c().await?;

    let snap = metrics.snapshot();
    info!("수신 종료");
    info!("  수신 바이트: {}", snap.recv_bytes_total);
    info!("  보낸 ACK: {}", snap.acks_sent);
    info!("  보낸 NACK: {}", snap.nacks_sent);
    info!("  감지한 갭: {}", snap.seq_gaps_detected);

    receiver.stop().await?;
    Ok(())
}
