//! Line-oriented front end: reads intents from stdin, prints state and events.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast::error::RecvError, mpsc, watch};
use tracing::warn;

use crate::engine::CallCommand;
use crate::events::{CallEvent, EventReceiver};
use crate::state::{CallState, ModalPhase, RoomOccupancy};

#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleInput {
    Command(CallCommand),
    ShowId,
    Help,
    Unknown(String),
}

pub const HELP: &str = "commands: create | join <room id> | camera | mic | hangup | back | id | quit";

pub fn parse_line(line: &str) -> ConsoleInput {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let command = match word.to_ascii_lowercase().as_str() {
        "create" => CallCommand::CreateRoom,
        "join" if rest.is_empty() => CallCommand::EnterRoomId,
        "join" => CallCommand::JoinRoom(rest.to_string()),
        "back" => CallCommand::GoBack,
        "camera" | "cam" => CallCommand::ToggleCamera,
        "mic" => CallCommand::ToggleMic,
        "hangup" | "hang-up" => CallCommand::HangUp,
        "quit" | "exit" => CallCommand::Shutdown,
        "id" => return ConsoleInput::ShowId,
        "help" | "?" | "" => return ConsoleInput::Help,
        _ => return ConsoleInput::Unknown(line.to_string()),
    };
    ConsoleInput::Command(command)
}

fn on_off(active: bool) -> &'static str {
    if active {
        "on"
    } else {
        "off"
    }
}

pub fn describe(state: &CallState) -> String {
    let screen = match state.modal_phase {
        ModalPhase::ChoosingRole => return "[choose: create | join]".to_string(),
        ModalPhase::EnteringRoomId => return "[enter: join <room id> | back]".to_string(),
        ModalPhase::InCall => match state.room_occupancy {
            RoomOccupancy::Empty => "The room is empty. Share the room ID to start a call!".to_string(),
            RoomOccupancy::Occupied => format!(
                "With {}: video {}, audio {}",
                state.remote_identity.as_deref().unwrap_or("remote"),
                on_off(state.remote_video_active),
                on_off(state.remote_audio_active),
            ),
        },
    };
    format!(
        "{} | You: camera {}, mic {}",
        screen,
        on_off(state.local_video_active),
        on_off(state.local_audio_active)
    )
}

pub fn format_event(event: &CallEvent) -> String {
    match event {
        CallEvent::Registered { identity } => format!("Room ID: {}", identity),
        CallEvent::InboundConnection { from } => format!("{} is connecting", from),
        CallEvent::InboundCall { from } => format!("Incoming call from {}", from),
        CallEvent::PayloadReceived { payload, .. } => payload.clone(),
        CallEvent::RoomOccupied { remote } => format!("{} is in the room", remote),
        CallEvent::LocalTrackStarted { kind } => format!("Your {} is on", kind),
        CallEvent::LocalTrackStopped { kind } => format!("Your {} is off", kind),
        CallEvent::RemoteTrackStarted { kind } => format!("Receiving remote {}", kind),
        CallEvent::RemoteTrackStopped { kind } => format!("Remote {} stopped", kind),
        CallEvent::CallEnded { remote } => format!("Call with {} ended", remote),
        CallEvent::Failure { kind, message } => format!("error ({:?}): {}", kind, message),
    }
}

/// Run the console until stdin closes or `quit` is entered.
pub async fn run_console(
    cmd_tx: mpsc::Sender<CallCommand>,
    mut state_rx: watch::Receiver<CallState>,
    mut event_rx: EventReceiver,
) {
    tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(event) => println!("* {}", format_event(&event)),
                Err(RecvError::Lagged(n)) => warn!("Console skipped {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut watch_rx = state_rx.clone();
    tokio::spawn(async move {
        while watch_rx.changed().await.is_ok() {
            let line = describe(&watch_rx.borrow_and_update());
            println!("{}", line);
        }
    });

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read stdin: {}", e);
                break;
            }
        };

        match parse_line(&line) {
            ConsoleInput::Command(command) => {
                let quit = command == CallCommand::Shutdown;
                if cmd_tx.send(command).await.is_err() || quit {
                    return;
                }
            }
            ConsoleInput::ShowId => {
                let state = state_rx.borrow_and_update();
                match &state.local_identity {
                    Some(id) => println!("Room ID: {}", id),
                    None => println!("Not registered yet"),
                }
            }
            ConsoleInput::Help => println!("{}", HELP),
            ConsoleInput::Unknown(line) => println!("unknown command '{}' ({})", line, HELP),
        }
    }

    let _ = cmd_tx.send(CallCommand::Shutdown).await;
}
