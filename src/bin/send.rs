//! SOM 송신 데모 - SSE over MIDI
//!
//! SSE 엔벨로프를 UMP 패킷으로 조각내 UDP 피어로 전송함
//! - 수신측 ACK/NACK 컨트롤 엔벨로프를 같은 세션으로 받아 재전송 처리
//!
//! 사용법:
//!   cargo run --release --bin som-send -- [OPTIONS]
//!
//! 예시:
//!   cargo run --release --bin som-send -- --peer 127.0.0.1:7000 --count 100

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use som::{
    Config, JrClock, Metrics, Reliability, RtpMidiConfig, RtpMidiSession, SseEnvelope,
    SseReceiver, SseSender, EV_MESSAGE,
};

/// 송신 데모 설정
struct SendConfig {
    bind_addr: SocketAddr,
    peer_addr: SocketAddr,
    count: u64,
    message: String,
    interval_ms: u64,
    window: Option<usize>,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:0".parse().unwrap(),
            peer_addr: "127.0.0.1:7000".parse().unwrap(),
            count: 10,
            message: "hello from som".into(),
            interval_ms: 100,
            window: None,
        }
    }
}

fn parse_args() -> SendConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = SendConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    config.bind_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--peer" | "-p" => {
                if i + 1 < args.len() {
                    config.peer_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--count" | "-c" => {
                if i + 1 < args.len() {
                    config.count = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--message" | "-m" => {
                if i + 1 < args.len() {
                    config.message = args[i + 1].clone();
                    i += 1;
                }
            }
            "--interval" => {
                if i + 1 < args.len() {
                    config.interval_ms = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--window" | "-w" => {
                if i + 1 < args.len() {
                    config.window = Some(args[i + 1].parse().expect("유효한 숫자 필요"));
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!(
                    r#"som-send - SSE over MIDI 송신 데모

SSE 엔벨로프를 MIDI 2.0 UMP 패킷으로 조각내 UDP 피어로 전송

사용법:
  cargo run --release --bin som-send -- [OPTIONS]

옵션:
  -b, --bind <ADDR>      로컬 바인드 주소 (기본: 0.0.0.0:0 = 자동 할당)
  -p, --peer <ADDR>      수신측 주소 (기본: 127.0.0.1:7000)
  -c, --count <N>        보낼 엔벨로프 수 (기본: 10)
  -m, --message <TEXT>   엔벨로프 페이로드 (기본: "hello from som")
  --interval <MS>        송신 간격 밀리초 (기본: 100)
  -w, --window <N>       송신 윈도우 (기본: 무제한)
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

    info!("som-send 시작");
    info!("피어 주소: {}", args.peer_addr);

    let mut protocol = Config::default();
    if let Some(window) = args.window {
        protocol.window = window;
    }

    let mut session_config = RtpMidiConfig::from_config("som-send", args.bind_addr, &protocol);
    session_config.peer_addr = Some(args.peer_addr);
    let transport = Arc::new(RtpMidiSession::new(session_config));

    let metrics = Arc::new(Metrics::new());
    let clock = Arc::new(JrClock::new());

    let receiver = SseReceiver::new(
        transport.clone(),
        Arc::new(Mutex::new(Reliability::with_capacity(
            protocol.retransmit_buffer_cap,
            metrics.clone(),
        ))),
        metrics.clone(),
        clock.clone(),
        protocol.clone(),
    );
    let sender = SseSender::new(
        transport.clone(),
        Arc::new(Mutex::new(Reliability::with_capacity(
            protocol.retransmit_buffer_cap,
            metrics.clone(),
        ))),
        metrics.clone(),
        clock,
        protocol,
    );
    sender.listen(&receiver);

    // 수신자가 전송 계층을 열고 컨트롤 엔벨로프 처리를 담당
    receiver.start().await?;
    info!("로컬 주소: {}", transport.local_addr()?);

    for i in 0..args.count {
        let mut env = SseEnvelope::new(EV_MESSAGE, 0, Some(args.message.clone()));
        env.id = Some(format!("demo-{}", i));
        sender.send(env).await?;
        sender.flush().await?;

        if args.interval_ms > 0 {
            tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
        }
    }

    // ACK 수신 대기 (최대 3초)
    for _ in 0..30 {
        if sender.pending_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let snap = metrics.snapshot();
    info!("송신 완료");
    info!("  엔벨로프: {}", args.count);
    info!("  송신 바이트: {}", snap.send_bytes_total);
    info!("  재전송 패킷: {}", snap.retransmits);
    info!("  미확인 시퀀스: {}", sender.pending_count());
    info!("  핸드쉐이크: {:?}", transport.handshake_state());

    sender.close().await?;
    Ok(())
}
