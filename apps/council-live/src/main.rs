mod cli;
mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use council_bus::StompConnector;
use council_sync::{
    EntityKey, HttpBackend, SessionView, SyncConfig, Transition, ViewEvent, VoteOutcome,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::cli::{Announcement, Cli, Commands};
use crate::telemetry::Telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let telemetry = Telemetry::init()?;

    let mut config = SyncConfig::from_env();
    cli.apply(&mut config);
    info!(ws = %config.ws_url, api = %config.api_url, "starting council-live");

    let backend = HttpBackend::new(
        config.api_url.clone(),
        config.token.clone(),
        config.request_timeout,
    )
    .context("failed to build HTTP client")?;
    let view = SessionView::new(
        Arc::new(StompConnector::new(config.stomp_config())),
        Arc::new(backend),
        config.reconnect_policy(),
    );
    let result = run(cli.command, &view).await;
    view.close();

    if cli.print_metrics {
        println!("{}", telemetry.render_metrics());
    }
    result
}

async fn run(command: Commands, view: &SessionView) -> Result<()> {
    match command {
        Commands::Watch {
            session,
            amendments_of,
        } => {
            let mut events = view.events();
            let topics = view.mount(session).await.context("failed to load agenda")?;
            for topic in &topics {
                println!(
                    "topic {:>4}  {:<11} {}",
                    topic.id,
                    topic.status.as_str(),
                    topic.title
                );
            }
            for topic in amendments_of {
                view.watch_amendments(topic)
                    .await
                    .with_context(|| format!("failed to load amendments of topic {topic}"))?;
            }
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(event) => print_event(&event),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "event stream lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            Ok(())
        }
        Commands::Vote {
            session,
            topic,
            amendment,
            vote,
        } => {
            view.mount(session).await.context("failed to load agenda")?;
            let outcome = match amendment {
                Some(amendment) => {
                    view.watch_amendments(topic).await?;
                    view.cast_amendment_vote(amendment, vote).await?
                }
                None => view.cast_vote(topic, vote).await?,
            };
            match outcome {
                VoteOutcome::Cast => println!("voted {vote}"),
                VoteOutcome::Unchanged => println!("already voted {vote}"),
            }
            Ok(())
        }
        Commands::Transition {
            session,
            action,
            topic,
            amendment,
        } => {
            view.mount(session).await.context("failed to load agenda")?;
            let key = match amendment {
                Some(amendment) => {
                    view.watch_amendments(topic).await?;
                    EntityKey::amendment(amendment)
                }
                None => EntityKey::topic(topic),
            };
            let transition = Transition::from(action);
            view.transition(key, transition).await?;
            println!("{key}: {transition} requested");
            Ok(())
        }
        Commands::Present { session, topic } => {
            view.mount(session).await.context("failed to load agenda")?;
            let outcome = view.present(topic).await?;
            println!("present topic {topic}: {outcome:?}");
            Ok(())
        }
        Commands::Announce { session, kind } => {
            view.mount(session).await.context("failed to load agenda")?;
            let outcome = match kind {
                Announcement::Topic => view.announce_new_topic().await?,
                Announcement::Amendment => view.announce_new_amendment().await?,
            };
            println!("announced {kind:?}: {outcome:?}");
            Ok(())
        }
    }
}

fn print_event(event: &ViewEvent) {
    match event {
        ViewEvent::TallyUpdated { key, tally, status } => println!(
            "{:<16} {:<11} yes={} no={} abstained={} cant_vote={} not_voted={} absent={}",
            key.to_string(),
            status.as_str(),
            tally.yes,
            tally.no,
            tally.abstained,
            tally.cant_vote,
            tally.have_not_voted,
            tally.absent
        ),
        ViewEvent::VotingChanged { key, enabled } => {
            let state = if *enabled { "open" } else { "closed" };
            println!("{:<16} voting {state}", key.to_string());
        }
        ViewEvent::OwnVoteReset { key } => {
            println!("{:<16} restarted, your vote was reset", key.to_string());
        }
        ViewEvent::PresenterChanged(Some(topic)) => println!("presenting topic {topic}"),
        ViewEvent::PresenterChanged(None) => println!("presenter cleared"),
        ViewEvent::TopicsRefreshed(topics) => println!("agenda refreshed: {} topics", topics.len()),
        ViewEvent::AmendmentsRefreshed { topic, amendments } => {
            println!("topic {topic}: {} amendments", amendments.len());
        }
        ViewEvent::AmendmentDeleted(id) => println!("amendment {id} deleted"),
        ViewEvent::Connection {
            purpose,
            amendment,
            state,
        } => match amendment {
            Some(id) => info!(%purpose, amendment = id, state = state.as_str(), "channel state"),
            None => info!(%purpose, state = state.as_str(), "channel state"),
        },
    }
}
