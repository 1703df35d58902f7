//! Team device: mirrors the live session and buzzes from stdin.
//!
//! Settings come from `HUB_URL`, `SESSION_ID`, `TEAM_ID` and `DEVICE_ID`.
//! Commands, one per line: `buzz`, `answer <text>`, `state`, `quit`.

use std::env;

use anyhow::Context;
use live_quiz_back::{
    client::{
        listener::BusListener,
        runtime::{ClientConfig, ClientStatus, TeamClient},
    },
    dto::bus::{BusEvent, BusEventKind},
};
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    time::Instant,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let url = env::var("HUB_URL").unwrap_or_else(|_| "ws://localhost:8080/ws".into());
    let session_id: Uuid = env::var("SESSION_ID")
        .context("SESSION_ID is required")?
        .parse()
        .context("SESSION_ID is not a UUID")?;
    let team_id: Uuid = env::var("TEAM_ID")
        .context("TEAM_ID is required")?
        .parse()
        .context("TEAM_ID is not a UUID")?;
    let device_id = env::var("DEVICE_ID").unwrap_or_else(|_| Uuid::new_v4().to_string());
    info!(%session_id, %team_id, %device_id, "starting team client");

    let client = TeamClient::spawn(
        ClientConfig::new(url, session_id, team_id, device_id),
        listener(team_id),
    );

    let mut status = client.status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            info!(status = ?current, "connection status");
            if matches!(current, ClientStatus::Kicked | ClientStatus::Stopped) {
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        let line = line.trim();
        match line.split_once(' ').unwrap_or((line, "")) {
            ("buzz", _) => client.buzz()?,
            ("answer", text) if !text.is_empty() => client.answer(Value::String(text.to_owned()))?,
            ("state", _) => {
                let mirror = client.mirror();
                let mirror = mirror.read().await;
                match mirror.state() {
                    Some(game) => println!(
                        "question={:?} armed={} locked={:?} remaining_ms={}",
                        game.active_instance.as_ref().map(|instance| &instance.question_ref),
                        game.buzzer_armed,
                        game.locked_team,
                        mirror.remaining_ms(Instant::now()),
                    ),
                    None => println!("waiting for the first snapshot"),
                }
            }
            ("quit", _) => break,
            ("", _) => {}
            _ => warn!(input = %line, "unknown command; try buzz, answer <text>, state or quit"),
        }
    }

    client.shutdown().await;
    Ok(())
}

fn listener(team_id: Uuid) -> BusListener {
    let mut listener = BusListener::for_team(team_id);
    listener
        .on(BusEventKind::StartQuestion, |event, _| {
            if let BusEvent::StartQuestion(start) = event {
                println!("question {} ({}) started", start.sequence, start.question_ref);
            }
        })
        .on(BusEventKind::BuzzerReset, |_, _| println!("buzzer open"))
        .on(BusEventKind::RevealAnswer, |event, _| {
            if let BusEvent::RevealAnswer(reveal) = event {
                let verdict = if reveal.correct { "correct" } else { "incorrect" };
                println!("{verdict} ({:+} points)", reveal.points);
            }
        })
        .on(BusEventKind::KickTeam, |_, _| println!("released by the operator"))
        .on(BusEventKind::ResetAll, |_, _| println!("board reset"));
    listener
}
