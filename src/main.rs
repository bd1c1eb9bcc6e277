use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use xiaozhi_client::{BootOutcome, ClientConfig, Engine, EngineEvent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "xiaozhi_client=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match ClientConfig::new() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let mut engine = Engine::new(config);
    let mut events = engine
        .take_events()
        .expect("event stream already taken");

    match engine.boot(false).await? {
        BootOutcome::Ready => {}
        BootOutcome::AwaitingActivation {
            code,
            challenge,
            timeout_ms,
        } => {
            println!("Bind this device at xiaozhi.me with code: {}", code);
            if let Some(ms) = timeout_ms {
                println!("The code expires in {} s.", ms / 1000);
            }
            println!("Waiting for confirmation...");
            engine.complete_activation(&challenge).await?;
        }
    }

    println!("Type a message and press enter to talk; Ctrl-D to quit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(EngineEvent::WebSocketReady { sample_rate, .. }) => {
                    println!("[connected, downstream {} Hz]", sample_rate);
                }
                Some(EngineEvent::Tts { state, text }) => {
                    if let Some(text) = text {
                        if state == "sentence_start" {
                            println!("xiaozhi: {}", text);
                        }
                    }
                }
                Some(EngineEvent::Emotion(emotion)) => {
                    println!("[emotion: {}]", emotion);
                }
                Some(EngineEvent::Error { kind, detail }) => {
                    eprintln!("[{:?}] {}", kind, detail);
                }
                Some(EngineEvent::Disconnected) => {
                    println!("[disconnected]");
                    break;
                }
                Some(_) => {}
                None => break,
            },
            line = lines.next_line() => match line? {
                Some(line) if !line.trim().is_empty() => {
                    if let Err(e) = engine.send_text_message(line.trim()).await {
                        eprintln!("send failed: {}", e);
                    }
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    engine.disconnect().await;
    Ok(())
}
