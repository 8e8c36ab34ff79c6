//! DTL 위성측 노드 (송신자) - Delay-Tolerant Transfer Layer
//!
//! 지상국 명령을 받아 파일 조각을 내려보내는 노드
//! - CREATE_TRANS로 송신 트랜잭션 생성, INIT_TRANS 응답
//! - GENERATE_* / GET_SINGLE_PACKET으로 누락 조각 전송
//! - UPDATE_MISSING_FRAGMENTS로 지상국 수신 상태 반영
//!
//! 사용법:
//!   cargo run --release --bin dtl-spacecraft -- [OPTIONS]
//!
//! 예시:
//!   # 기본 실행
//!   cargo run --release --bin dtl-spacecraft -- --bind 0.0.0.0:7000
//!
//!   # 30% 손실 링크 흉내
//!   cargo run --release --bin dtl-spacecraft -- --loss 0.3

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use dtl::{Config, Dispatcher, Message};

/// 노드 설정
struct SpacecraftConfig {
    bind_addr: SocketAddr,
    loss: f64,
    stats_interval: Duration,
    config: Config,
}

impl Default for SpacecraftConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7000)),
            loss: 0.0,
            stats_interval: Duration::from_secs(10),
            config: Config::flight(),
        }
    }
}

type BoxError = Box<dyn std::error::Error>;

fn parse_args() -> Result<SpacecraftConfig, BoxError> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = SpacecraftConfig::default();

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match args[i].as_str() {
            "--bind" | "-b" => {
                if let Some(value) = value {
                    config.bind_addr = value.parse()?;
                    i += 1;
                }
            }
            "--preset" | "-p" => {
                if let Some(value) = value {
                    config.config = match value.as_str() {
                        "flight" => Config::flight(),
                        "ground" => Config::ground_station(),
                        "lossy" => Config::lossy_link(),
                        other => return Err(format!("알 수 없는 프리셋: {}", other).into()),
                    };
                    i += 1;
                }
            }
            "--fragment-size" => {
                if let Some(value) = value {
                    config.config.fragment_size = value.parse()?;
                    i += 1;
                }
            }
            "--dump-dir" => {
                if let Some(value) = value {
                    config.config.dump_dir = value.into();
                    i += 1;
                }
            }
            "--loss" => {
                if let Some(value) = value {
                    config.loss = value.parse::<f64>()?.clamp(0.0, 1.0);
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!(
                    r#"DTL Spacecraft - Delay-Tolerant Transfer Layer 위성측 노드

지상국 명령에 따라 파일 조각을 생성해 내려보냄
- 누락 보고(UPDATE_MISSING_FRAGMENTS)로 재전송 대상 결정
- 타이머 없음, 모든 전송은 지상국 요청으로 시작

사용법:
  cargo run --release --bin dtl-spacecraft -- [OPTIONS]

옵션:
  -b, --bind <ADDR>         바인드 주소 (기본: 0.0.0.0:7000)
  -p, --preset <NAME>       설정 프리셋 flight | ground | lossy (기본: flight)
  --fragment-size <SIZE>    조각 크기 바이트 (기본: 200, 양측이 같아야 함)
  --dump-dir <PATH>         진단 덤프 폴더 (기본: transaction_history)
  --loss <RATIO>            송신 손실 비율 0.0~1.0 (시험용, 기본: 0)
  -h, --help                이 도움말 출력

예시:
  # 기본 실행
  cargo run --release --bin dtl-spacecraft

  # 손실 링크 시험
  cargo run --release --bin dtl-spacecraft -- --preset lossy --loss 0.3
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // 로깅 설정 (RUST_LOG 우선)
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let node_config = parse_args()?;

    info!("DTL Spacecraft starting...");
    info!("Bind address: {}", node_config.bind_addr);
    info!("Fragment size: {} bytes", node_config.config.fragment_size);
    info!("Max transactions: {}", node_config.config.max_transactions);
    if node_config.loss > 0.0 {
        info!("Simulated loss: {:.1}%", node_config.loss * 100.0);
    }

    let socket = Arc::new(UdpSocket::bind(node_config.bind_addr).await?);
    let dispatcher = Dispatcher::new(node_config.config.clone());

    // ═══════════════════════════════════════════════════════════════
    // 송신 큐 + 송신 태스크 (손실 흉내 포함)
    // ═══════════════════════════════════════════════════════════════
    let (out_tx, mut out_rx) = mpsc::channel::<(Vec<u8>, SocketAddr)>(10_000);
    let send_socket = socket.clone();
    let loss = node_config.loss;
    let _send_task = tokio::spawn(async move {
        while let Some((bytes, addr)) = out_rx.recv().await {
            let dropped = loss > 0.0 && rand::thread_rng().gen_bool(loss);
            if dropped {
                continue;
            }
            if let Err(e) = send_socket.send_to(&bytes, addr).await {
                warn!("송신 실패: {}", e);
            }
        }
    });

    // ─────────────────────────────────────────────────────────────────
    // 수신 및 처리 루프
    // ─────────────────────────────────────────────────────────────────
    let mut buf = vec![0u8; 65535];
    let mut stats_tick = tokio::time::interval(node_config.stats_interval);

    info!("Waiting for ground station commands...");

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (len, addr) = received?;

                let message = match Message::from_bytes(&buf[..len]) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("메시지 파싱 실패 ({}): {}", addr, e);
                        continue;
                    }
                };
                debug!("{:?} 수신: {}", message.msg_type(), addr);

                match dispatcher.handle(message) {
                    Ok(replies) => {
                        for reply in replies {
                            out_tx.send((reply.to_bytes()?, addr)).await?;
                        }
                    }
                    Err(e) => warn!("명령 처리 실패 [{:?}]: {}", e.kind(), e),
                }
            }

            _ = stats_tick.tick() => {
                let manager = dispatcher.manager();
                let stats = manager.stats();
                if stats.total() > 0 {
                    info!("{}", stats.summary());
                }
                manager.clear_aborted(dtl::Direction::Tx);
            }
        }
    }
}
