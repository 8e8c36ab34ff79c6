//! DTL 지상국 노드 (수신자) - Delay-Tolerant Transfer Layer
//!
//! 위성에 파일을 요청하고 조각을 조립하는 노드
//! - CREATE_TRANS 전송 후 INIT_TRANS 대기
//! - 누락 조각을 GENERATE_* 명령으로 요청
//! - 수신이 멈추면 누락 보고 후 다시 요청
//!
//! 사용법:
//!   cargo run --release --bin dtl-ground -- [OPTIONS]
//!
//! 예시:
//!   # 기본 수신
//!   cargo run --release --bin dtl-ground -- --server 127.0.0.1:7000 --file images/cam0_0001.jpg
//!
//!   # 저장 이름 지정 + 32개씩 요청
//!   cargo run --release --bin dtl-ground -- -s 127.0.0.1:7000 -f log.bin -o log_0001.bin --batch 32

use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use dtl::{Config, Direction, Dispatcher, Message, TransactionId, TransactionState};

/// 노드 설정
struct GroundConfig {
    bind_addr: SocketAddr,
    server_addr: SocketAddr,
    file_reference: Option<String>,
    output_name: Option<String>,
    loss: f64,
    idle_timeout: Duration,
    max_retries: u32,
    config: Config,
}

impl Default for GroundConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            server_addr: SocketAddr::from(([127, 0, 0, 1], 7000)),
            file_reference: None,
            output_name: None,
            loss: 0.0,
            idle_timeout: Duration::from_millis(500),
            max_retries: 20,
            config: Config::ground_station(),
        }
    }
}

type BoxError = Box<dyn std::error::Error>;

fn parse_args() -> Result<GroundConfig, BoxError> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = GroundConfig::default();

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
            "--server" | "-s" => {
                if let Some(value) = value {
                    config.server_addr = value.parse()?;
                    i += 1;
                }
            }
            "--file" | "-f" => {
                if let Some(value) = value {
                    config.file_reference = Some(value.clone());
                    i += 1;
                }
            }
            "--output" | "-o" => {
                if let Some(value) = value {
                    config.output_name = Some(value.clone());
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
            "--batch" => {
                if let Some(value) = value {
                    config.config.batch_size = value.parse()?;
                    i += 1;
                }
            }
            "--receive-dir" => {
                if let Some(value) = value {
                    config.config.receive_dir = value.into();
                    i += 1;
                }
            }
            "--idle" => {
                if let Some(value) = value {
                    config.idle_timeout = Duration::from_millis(value.parse()?);
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
                    r#"DTL Ground - Delay-Tolerant Transfer Layer 지상국 노드

위성에 파일을 요청하고 비트맵 누락 보고로 재전송을 유도
- 수신 완료 시 SHA-256 검증 후 수신 폴더에 저장
- 검증 실패 시 진단 덤프 기록

사용법:
  cargo run --release --bin dtl-ground -- [OPTIONS]

옵션:
  -s, --server <ADDR>       위성 노드 주소 (기본: 127.0.0.1:7000)
  -b, --bind <ADDR>         바인드 주소 (기본: 0.0.0.0:0)
  -f, --file <REF>          위성측 파일 경로 (필수)
  -o, --output <NAME>       저장 파일 이름 (기본: 원격 파일 이름)
  -p, --preset <NAME>       설정 프리셋 flight | ground | lossy (기본: ground)
  --fragment-size <SIZE>    조각 크기 바이트 (기본: 200, 양측이 같아야 함)
  --batch <N>               한 번에 요청할 조각 수, 0이면 전체 (기본: 32)
  --receive-dir <PATH>      수신 폴더 (기본: received)
  --idle <MS>               수신 정지 판단 시간 (기본: 500)
  --loss <RATIO>            송신 손실 비율 0.0~1.0 (시험용, 기본: 0)
  -h, --help                이 도움말 출력

예시:
  # 이미지 수신
  cargo run --release --bin dtl-ground -- -f images/cam0_0001.jpg

  # 손실 링크 시험
  cargo run --release --bin dtl-ground -- -f log.bin --preset lossy --loss 0.3
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

/// 메시지 전송 (손실 흉내 포함)
async fn send(
    socket: &UdpSocket,
    addr: SocketAddr,
    messages: Vec<Message>,
    loss: f64,
) -> Result<(), BoxError> {
    for message in messages {
        let dropped = loss > 0.0 && rand::thread_rng().gen_bool(loss);
        if dropped {
            debug!("{:?} 손실 처리", message.msg_type());
            continue;
        }
        socket.send_to(&message.to_bytes()?, addr).await?;
    }
    Ok(())
}

fn rx_state(dispatcher: &Dispatcher, tid: TransactionId) -> Option<TransactionState> {
    dispatcher
        .manager()
        .get(Direction::Rx, tid)
        .ok()
        .map(|t| t.state())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // 로깅 설정 (RUST_LOG 우선)
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let node_config = parse_args()?;
    let file_reference = node_config
        .file_reference
        .clone()
        .ok_or("전송할 파일 경로 필요 (--file)")?;
    let output_name = node_config.output_name.clone().unwrap_or_else(|| {
        Path::new(&file_reference)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "received.bin".to_string())
    });

    info!("DTL Ground starting...");
    info!("Spacecraft address: {}", node_config.server_addr);
    info!("Requesting: {}", file_reference);

    let socket = UdpSocket::bind(node_config.bind_addr).await?;
    info!("Bound to local address: {}", socket.local_addr()?);

    let server_addr = node_config.server_addr;
    let loss = node_config.loss;
    let dispatcher = Dispatcher::new(node_config.config.clone());
    let mut buf = vec![0u8; 65535];

    // === Phase 1: CREATE_TRANS / INIT_TRANS ===
    let mut init = None;
    let mut retry_count = 0;

    while init.is_none() && retry_count < node_config.max_retries {
        if retry_count > 0 {
            info!("Retry #{}: Waiting for INIT_TRANS...", retry_count);
        }
        send(
            &socket,
            server_addr,
            vec![Dispatcher::request_transfer(file_reference.as_str())],
            loss,
        )
        .await?;

        if let Ok(received) =
            tokio::time::timeout(node_config.idle_timeout, socket.recv_from(&mut buf)).await
        {
            let (len, _) = received?;
            match Message::from_bytes(&buf[..len]) {
                Ok(message @ Message::InitTrans(_)) => init = Some(message),
                Ok(other) => debug!("{:?} 무시 (INIT_TRANS 대기 중)", other.msg_type()),
                Err(e) => warn!("메시지 파싱 실패: {}", e),
            }
        }

        retry_count += 1;
    }

    let init = init.ok_or("INIT_TRANS 수신 실패")?;
    let tid = init.tid().ok_or("INIT_TRANS에 tid 없음")?;
    let requests = dispatcher.handle(init)?;

    {
        let rx = dispatcher.manager().get(Direction::Rx, tid)?;
        info!("INIT_TRANS received:");
        info!("  Transaction: {}", tid);
        info!("  Fragments: {}", rx.num_packets());
        info!("  Hash: {}", rx.expected_hash());
    }
    send(&socket, server_addr, requests, loss).await?;

    // === Phase 2: 조각 수신 ===
    let start = Instant::now();
    let mut idle_polls = 0;

    loop {
        match rx_state(&dispatcher, tid) {
            Some(TransactionState::Complete) => break,
            Some(TransactionState::Aborted) | None => {
                return Err(format!("트랜잭션 {} 중단됨", tid).into());
            }
            _ => {}
        }

        match tokio::time::timeout(node_config.idle_timeout, socket.recv_from(&mut buf)).await {
            Ok(received) => {
                let (len, _) = received?;
                let message = match Message::from_bytes(&buf[..len]) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("메시지 파싱 실패: {}", e);
                        continue;
                    }
                };
                if message.tid() != Some(tid) {
                    debug!("다른 트랜잭션 메시지 무시: {:?}", message.tid());
                    continue;
                }

                idle_polls = 0;
                match dispatcher.handle(message) {
                    Ok(replies) => send(&socket, server_addr, replies, loss).await?,
                    Err(e) => warn!("조각 처리 실패 [{:?}]: {}", e.kind(), e),
                }
            }
            Err(_) => {
                idle_polls += 1;
                if idle_polls > node_config.max_retries {
                    let path = dispatcher.manager().dump(Direction::Rx, tid)?;
                    return Err(format!("응답 없음, 덤프: {}", path.display()).into());
                }

                let rx = dispatcher.manager().get(Direction::Rx, tid)?;
                info!(
                    "Progress: {:.1}% ({} missing), polling",
                    rx.progress() * 100.0,
                    rx.missing().len()
                );
                drop(rx);

                send(&socket, server_addr, dispatcher.poll(tid)?, loss).await?;
            }
        }
    }

    // 최종 보고 한 번 더 (유실 대비)
    send(&socket, server_addr, dispatcher.report(tid)?, loss).await?;

    let elapsed = start.elapsed();
    let saved = dispatcher.save_received(tid, &output_name)?;
    let rx = dispatcher.manager().get(Direction::Rx, tid)?;
    let stats = rx.stats();

    info!("Transfer complete!");
    info!("  Saved: {}", saved.display());
    info!("  Time: {:.2}s", elapsed.as_secs_f64());
    info!("  Fragments received: {}", stats.fragments_ingested);
    info!("  Duplicates: {}", stats.duplicate_fragments);

    Ok(())
}
