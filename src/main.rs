use agent_voice_client::{
    agent::{AgentDirectory, JsonFileAgentDirectory},
    capture::{list_input_devices, FrameContainer},
    config::{load_config, Environment},
    protocol::{AgentConfig, Speaker},
    ClientError, ConnectionStatus, ConversationClient, SessionConfiguration, Transcript,
};
use anyhow::{bail, Context};
use chrono::{DateTime, Local};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "agent-talk")]
#[command(about = "Talk to a hosted voice agent from the terminal")]
#[command(long_about = "
Opens a real-time voice conversation with a hosted agent. Microphone audio is
streamed to the agent and its replies are played on the default output device.
The server address comes from API_BASE_URL (a .env file is read if present).

EXAMPLES:
  # List available microphones
  agent-talk --list-devices

  # Start a conversation with a stored agent
  agent-talk --agents agents.json --agent-id hindi-1

  # Start a conversation with inline settings against a local server
  agent-talk --dev --stt-type AZURE --stt-language hi-IN \\
      --tts-type AZURE --tts-voice hi-IN-AaravNeural --llm-type CHATGPT
")]
struct Args {
    /// List available input devices and exit
    #[arg(long)]
    list_devices: bool,

    /// JSON file containing agent records
    #[arg(long, requires = "agent_id")]
    agents: Option<PathBuf>,

    /// Agent to talk to, looked up in --agents
    #[arg(long)]
    agent_id: Option<String>,

    #[arg(long)]
    stt_type: Option<String>,

    #[arg(long)]
    stt_language: Option<String>,

    #[arg(long)]
    tts_type: Option<String>,

    #[arg(long)]
    tts_voice: Option<String>,

    #[arg(long, default_value = "CHATGPT")]
    llm_type: String,

    #[arg(long)]
    initial_message: Option<String>,

    #[arg(long)]
    prompt: Option<String>,

    /// Use plaintext ws:// regardless of ENVIRONMENT
    #[arg(long)]
    dev: bool,

    /// Input device name (default device if omitted)
    #[arg(long)]
    input_device: Option<String>,

    /// How captured frames are packaged: wav, linear16 or mulaw
    #[arg(long)]
    frame_container: Option<FrameContainer>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.list_devices {
        for device in list_input_devices()? {
            println!(
                "{}{} ({} channels)",
                device.name,
                if device.is_default { " [default]" } else { "" },
                device.channel_count
            );
        }
        return Ok(());
    }

    let mut config = load_config()?;
    if args.dev {
        config.environment = Environment::Dev;
    }
    if let Some(device) = args.input_device.clone() {
        config.capture.device_name = Some(device);
    }
    if let Some(container) = args.frame_container {
        config.capture.container = container;
    }

    let session_config = session_config(&args).await?;
    let client_id = uuid::Uuid::new_v4().to_string();
    log::info!("Starting conversation as client {}", client_id);

    let client = ConversationClient::new(client_id, config);
    client.on_status_change(print_status);
    client.on_message(print_transcript);
    client.on_error(|err: &ClientError| eprintln!("error: {}", err));

    tokio::select! {
        result = client.connect(session_config) => {
            result.context("conversation could not be started")?;
        }
        _ = tokio::signal::ctrl_c() => {
            client.disconnect();
            client.closed().await;
            return Ok(());
        }
    }

    println!("Connected. Speak now; press Ctrl+C to hang up.");
    tokio::select! {
        _ = client.closed() => {
            println!("Conversation ended.");
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("Received Ctrl+C, hanging up...");
            client.disconnect();
            client.closed().await;
            println!("Goodbye!");
        }
    }

    if let Some(error) = client.status().error {
        bail!("conversation ended with an error: {}", error);
    }
    Ok(())
}

async fn session_config(args: &Args) -> anyhow::Result<SessionConfiguration> {
    if let Some(path) = &args.agents {
        let agent_id = args.agent_id.as_deref().unwrap_or_default();
        let directory = JsonFileAgentDirectory::new(path);
        let agent = directory
            .get_agent(agent_id)
            .await?
            .with_context(|| format!("agent '{}' not found in {}", agent_id, path.display()))?;
        if agent.is_deleted {
            bail!("agent '{}' has been deleted", agent_id);
        }
        log::info!("Using agent '{}' ({})", agent.name, agent.uid);
        return Ok(SessionConfiguration::from(&agent));
    }

    let (Some(stt_type), Some(stt_language), Some(tts_type), Some(tts_voice)) = (
        args.stt_type.clone(),
        args.stt_language.clone(),
        args.tts_type.clone(),
        args.tts_voice.clone(),
    ) else {
        bail!("either --agents/--agent-id or all of --stt-type, --stt-language, --tts-type and --tts-voice are required");
    };

    Ok(SessionConfiguration {
        agent_config: AgentConfig {
            llm_type: args.llm_type.clone(),
            initial_message: Some(args.initial_message.clone().unwrap_or_default()),
            prompt_preamble: Some(args.prompt.clone().unwrap_or_default()),
            filler_type: None,
            bg_noise: Some(false),
        },
        stt_type,
        stt_language_id: stt_language,
        tts_type,
        tts_voice,
    })
}

fn print_status(status: ConnectionStatus) {
    match (status.is_connected, status.is_connecting, status.error) {
        (_, _, Some(error)) => println!("[status] disconnected: {}", error),
        (true, _, None) => println!("[status] connected"),
        (false, true, None) => println!("[status] connecting..."),
        (false, false, None) => println!("[status] disconnected"),
    }
}

fn print_transcript(transcript: Transcript) {
    let secs = transcript.timestamp.trunc() as i64;
    let nanos = (transcript.timestamp.fract() * 1e9) as u32;
    let time = DateTime::from_timestamp(secs, nanos)
        .map(|t| t.with_timezone(&Local).format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string());
    let who = match transcript.sender {
        Speaker::Agent => "agent",
        Speaker::Human => "you",
    };
    println!("{} {:>5}: {}", time, who, transcript.text);
}
