//! Line-mode chat client (spec §1's only first-party surface beyond the
//! bus itself): reads stdin, publishes a `UserMessage` per line, and prints
//! whatever lands on the user-response topic, final or not. Grounded on the
//! teacher's TUI input loop's publish-and-await-reply shape, stripped down
//! to a plain terminal since the spec treats richer surfaces as external
//! collaborators (spec §1).

use std::sync::Arc;

use anyhow::Result;
use rockbot_runtime::messages::{AgentReply, UserMessage};
use rockbot_transport::{DispatchFn, Subscription, Transport};
use rockbot_types::{DispatchOutcome, Envelope};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::app::App;

/// Subscribes a printer to the user-response topic and reads lines from
/// stdin until EOF or the session sends `/quit`, publishing each as a
/// `UserMessage` on `app.config.agent.name`'s behalf.
pub async fn run(app: &App, session_id: &str) -> Result<()> {
    let printer: DispatchFn = Arc::new(move |envelope: Envelope, _ct| {
        Box::pin(async move {
            if let Ok(reply) = envelope.body_as::<AgentReply>() {
                if reply.is_final {
                    println!("{}", reply.content);
                } else {
                    println!("... {}", reply.content);
                }
            }
            DispatchOutcome::Ack
        })
    });
    let subscription: Subscription = app
        .transport
        .subscribe("user.response", "rockbot.cli-printer", app.config.transport.prefetch, printer, app.shutdown.child_token())
        .await?;

    println!("rockbot ready — type a message, or /quit to exit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let Some(line) = lines.next_line().await? else { break };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed == "/quit" {
            break;
        }

        let envelope = Envelope::builder("UserMessage", &app.config.agent.name)
            .json_body(&UserMessage { session_id: session_id.to_string(), content: trimmed.to_string() })?
            .build();
        app.transport.publish(crate::app::TOPIC_USER_REQUEST, envelope).await?;
    }

    subscription.unsubscribe();
    Ok(())
}
