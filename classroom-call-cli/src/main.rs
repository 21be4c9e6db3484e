//! Classroom Call CLI Application

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use classroom_call_core::prelude::*;
use classroom_call_core::MediaPermissions;
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Participant id of the caller (random if omitted)
    #[arg(short, long, env = "CLASSROOM_CALL_IDENTITY")]
    identity: Option<String>,

    /// JSON configuration file
    #[arg(short, long, env = "CLASSROOM_CALL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a caller and a callee against an in-process document store
    Demo {
        /// Participant id of the callee
        #[arg(long, default_value = "bob")]
        peer: String,

        /// Enable video
        #[arg(long)]
        video: bool,

        /// Refuse camera access on the caller side
        #[arg(long)]
        deny_camera: bool,

        /// Seconds to wait for remote media before hanging up
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("classroom_call=info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => CallConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CallConfig::default(),
    };

    match cli.command {
        Commands::Demo {
            peer,
            video,
            deny_camera,
            timeout,
        } => {
            let identity = cli.identity.unwrap_or_else(generate_random_identity);
            handle_demo(
                config,
                &identity,
                &peer,
                video,
                deny_camera,
                Duration::from_secs(timeout),
            )
            .await?;
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

async fn handle_demo(
    config: CallConfig,
    identity: &str,
    peer: &str,
    video: bool,
    deny_camera: bool,
    timeout: Duration,
) -> Result<()> {
    let caller_id = ParticipantId::new(identity).context("invalid caller id")?;
    let callee_id = ParticipantId::new(peer).context("invalid callee id")?;
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());

    let caller_capture = SyntheticCapture::new(MediaPermissions {
        microphone: true,
        camera: !deny_camera,
    });
    let caller = CallSessionController::builder(caller_id.clone(), Arc::clone(&store))
        .with_config(config.clone())
        .with_capture(Arc::new(caller_capture))
        .build()?;
    let callee = CallSessionController::builder(callee_id.clone(), Arc::clone(&store))
        .with_config(config)
        .build()?;

    println!("📞 {} is calling {}...", caller_id, callee_id);
    let mut events = caller.subscribe_events();

    let session_id = match caller.start_call(&callee_id, video).await {
        Ok(session_id) => session_id,
        Err(e) => {
            report_end(&caller);
            return Err(e.into());
        }
    };
    println!("✅ Offer published in session {}", session_id);

    if let Err(e) = callee.answer_call(session_id, video).await {
        println!("❌ {} could not answer: {}", callee_id, e);
        caller.hangup().await;
        report_end(&caller);
        return Ok(());
    }
    println!("✅ {} answered", callee_id);

    let connected = tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(CallEvent::StateChanged {
                    to: CallState::InCall,
                    ..
                }) => return true,
                Ok(CallEvent::CallEnded { .. }) => return false,
                Ok(other) => tracing::debug!("Received event: {:?}", other),
                Err(e) => {
                    tracing::error!("Event stream error: {}", e);
                    return false;
                }
            }
        }
    })
    .await
    .unwrap_or(false);

    if connected {
        println!("🎥 Remote media is flowing");
    } else {
        println!(
            "⚠️  No remote media after {}s (state: {:?})",
            timeout.as_secs(),
            caller.state()
        );
    }

    callee.hangup().await;
    caller.hangup().await;
    report_end(&caller);
    Ok(())
}

fn report_end(controller: &CallSessionController) {
    if let Some(reason) = controller.end_reason() {
        println!("📞 Call ended: {}", reason.user_message());
    }
}

fn generate_random_identity() -> String {
    const NAMES: &[&str] = &[
        "ada", "alan", "barbara", "claude", "donald", "edsger", "frances", "grace", "john",
        "katherine", "ken", "leslie", "margaret", "niklaus", "radia", "tony",
    ];

    let mut rng = rand::thread_rng();
    let name = NAMES[rng.gen_range(0..NAMES.len())];
    format!("{}-{}", name, rng.gen_range(100..1000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_identity_is_valid() {
        for _ in 0..20 {
            assert!(ParticipantId::new(generate_random_identity()).is_ok());
        }
    }

    #[test]
    fn test_cli_parses_demo() {
        let cli = Cli::parse_from(["classroom-call", "demo", "--video", "--timeout", "3"]);
        assert!(matches!(
            cli.command,
            Commands::Demo {
                video: true,
                timeout: 3,
                ..
            }
        ));
    }
}
