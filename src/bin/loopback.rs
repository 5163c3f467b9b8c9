//! DCFT 루프백 데모 - 프로세스 내 두 엔진 간 전송
//!
//! 두 개의 `LoopbackChannel` 로 송신/수신 엔진을 마주 연결하고
//! 데이터 청크 손실률을 지정해 재전송/혼잡제어 동작을 확인함
//!
//! 사용법:
//!   cargo run --release --bin dcft-loopback -- [OPTIONS]
//!
//! 예시:
//!   # 8MB 전송
//!   cargo run --release --bin dcft-loopback -- --size 8388608
//!
//!   # 5% 손실 + 일괄 ACK
//!   cargo run --release --bin dcft-loopback -- -f data.bin --loss 0.05 --batch-ack

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use dcft::{
    AckMode, AssembledData, Config, LoopbackChannel, TransferEngine, TransferEvent, TransferMeta,
};

/// 채널 최대 메시지 크기 (SCTP 일반값)
const MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// 데모 설정
struct DemoConfig {
    file_path: Option<PathBuf>,
    size: usize,
    loss_rate: f64,
    config: Config,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            file_path: None,
            size: 4 * 1024 * 1024,
            loss_rate: 0.0,
            config: Config {
                base_timeout_ms: 500,
                ..Config::default()
            },
        }
    }
}

fn parse_args() -> Result<DemoConfig, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut demo = DemoConfig::default();

    let mut i = 1;
    while i < args.len() {
        let value = |i: usize| {
            args.get(i + 1)
                .cloned()
                .ok_or_else(|| format!("{} 값 필요", args[i]))
        };
        match args[i].as_str() {
            "--file" | "-f" => {
                demo.file_path = Some(PathBuf::from(value(i)?));
                i += 1;
            }
            "--size" | "-s" => {
                demo.size = value(i)?.parse().map_err(|_| "유효한 숫자 필요".to_string())?;
                i += 1;
            }
            "--loss" | "-l" => {
                demo.loss_rate = value(i)?.parse().map_err(|_| "유효한 숫자 필요".to_string())?;
                i += 1;
            }
            "--chunk-size" => {
                demo.config.chunk_size =
                    value(i)?.parse().map_err(|_| "유효한 숫자 필요".to_string())?;
                i += 1;
            }
            "--batch-ack" => {
                demo.config.ack_mode = AckMode::Batched {
                    flush_interval_ms: 20,
                    max_batch: 32,
                };
            }
            "--low-spec" => {
                demo.config = Config {
                    base_timeout_ms: demo.config.base_timeout_ms,
                    ..Config::low_spec()
                };
            }
            "--help" | "-h" => {
                println!(
                    r#"DCFT Loopback - 프로세스 내 전송 데모

사용법:
  cargo run --release --bin dcft-loopback -- [OPTIONS]

옵션:
  -f, --file <PATH>       전송할 파일 (없으면 임의 데이터)
  -s, --size <BYTES>      임의 데이터 크기 (기본: 4MB)
  -l, --loss <RATIO>      데이터 청크 손실률 0.0~1.0 (기본: 0)
  --chunk-size <SIZE>     청크 크기 바이트 (기본: 16384)
  --batch-ack             일괄 ACK 사용
  --low-spec              저사양 설정 사용
  -h, --help              이 도움말 출력

로그 레벨은 RUST_LOG 로 지정 (기본: info)
"#
                );
                std::process::exit(0);
            }
            other => return Err(format!("알 수 없는 옵션: {}", other)),
        }
        i += 1;
    }

    Ok(demo)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let demo = parse_args()?;
    demo.config.validate()?;

    info!("DCFT Loopback starting...");
    info!("Chunk size: {} bytes", demo.config.chunk_size);
    info!("Loss rate: {:.1}%", demo.loss_rate * 100.0);
    info!("ACK mode: {:?}", demo.config.ack_mode);

    // 엔진 연결: sender_channel 프레임 → receiver, receiver_channel 프레임 → sender
    let (sender_channel, sender_frames) = LoopbackChannel::new(MAX_MESSAGE_SIZE);
    let (receiver_channel, receiver_frames) = LoopbackChannel::new(MAX_MESSAGE_SIZE);
    sender_channel.set_loss_rate(demo.loss_rate);

    let (sender_events_tx, mut sender_events) = mpsc::unbounded_channel();
    let (receiver_events_tx, mut receiver_events) = mpsc::unbounded_channel();

    let sender = Arc::new(TransferEngine::new(
        demo.config.clone(),
        Arc::clone(&sender_channel),
        "receiver",
        sender_events_tx,
    )?);
    let receiver = Arc::new(TransferEngine::new(
        demo.config.clone(),
        receiver_channel,
        "sender",
        receiver_events_tx,
    )?);
    receiver.spawn_pump(sender_frames);
    sender.spawn_pump(receiver_frames);

    let transfer_id = "loopback-1";
    match &demo.file_path {
        Some(path) => {
            info!("Loading file: {:?}", path);
            sender.send_file(path, transfer_id, "application/octet-stream")?;
        }
        None => {
            info!("Using test data ({} bytes)", demo.size);
            let data: Vec<u8> = (0..demo.size).map(|i| (i % 251) as u8).collect();
            sender.send_bytes(data, transfer_id, TransferMeta::new("random.bin", "application/octet-stream"))?;
        }
    }

    // 송신측 진행 로그
    let sender_log = tokio::spawn(async move {
        while let Some(event) = sender_events.recv().await {
            match event {
                TransferEvent::Progress(p) => info!(
                    "[send] {}/{} chunks, {:.2} MB/s, window={:?}",
                    p.chunks_done,
                    p.total_chunks,
                    p.speed / 1_000_000.0,
                    p.window_size
                ),
                other if other.is_terminal() => {
                    info!("[send] 종료: {:?}", other);
                    break;
                }
                _ => {}
            }
        }
    });

    let outcome = tokio::time::timeout(Duration::from_secs(600), async {
        while let Some(event) = receiver_events.recv().await {
            match event {
                TransferEvent::Progress(p) => {
                    info!("[recv] {}/{} bytes", p.bytes, p.total_bytes);
                }
                other if other.is_terminal() => return Some(other),
                _ => {}
            }
        }
        None
    })
    .await;

    match outcome {
        Ok(Some(TransferEvent::Complete(done))) => {
            info!("Transfer complete!");
            info!("  Time: {:.2}s", done.total_time.as_secs_f64());
            info!("  Total bytes: {}", done.total_bytes);
            info!("  Speed: {:.2} MB/s", done.average_speed / 1_000_000.0);
            if let Some(file) = done.file {
                info!("  SHA-256: {}", file.checksum);
                if let AssembledData::Memory(parts) = &file.data {
                    info!("  Aggregates: {}", parts.len());
                }
            }
        }
        Ok(Some(other)) => warn!("Transfer ended: {:?}", other),
        Ok(None) => warn!("이벤트 채널 종료"),
        Err(_) => warn!("전송 시간 초과"),
    }

    let _ = sender_log.await;
    info!(
        "Frames sent: {}, dropped: {}",
        sender_channel.sent_frames(),
        sender_channel.dropped_frames()
    );
    Ok(())
}
