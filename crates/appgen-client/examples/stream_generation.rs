use std::sync::Arc;

use appgen_client::prelude::*;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), appgen_client::ApiError> {
    appgen_client::init_observability();

    let client = Client::new(
        ClientConfig::from_env()?,
        StaticToken::new(std::env::var("APPGEN_TOKEN").unwrap_or_default()),
    )?;

    let session_id = std::env::args()
        .nth(1)
        .expect("usage: stream_generation <session-id>");

    // Keep the preview sandbox alive while the stream is on screen.
    let (heartbeat, mut heartbeat_events) =
        HeartbeatController::spawn(Arc::new(client.clone()), HeartbeatOptions::default());
    heartbeat.set_target(std::env::var("APPGEN_SANDBOX_ID").ok());
    tokio::spawn(async move {
        while let Some(event) = heartbeat_events.recv().await {
            if let HeartbeatEvent::PingFailed { sandbox_id, error } = event {
                eprintln!("keep-alive failed for {sandbox_id}: {error}");
            }
        }
    });

    let mut session = client.start_generation(
        GenerationRequest::new(session_id),
        GenerationOptions::default(),
    );
    while let Some(event) = session.next_event().await {
        match event {
            GenerationEvent::Thinking(note) => println!("… {}", note.message),
            GenerationEvent::FileStarted { path } => println!("-- {path}"),
            GenerationEvent::FileChunk { chunk, .. } => print!("{chunk}"),
            GenerationEvent::State(
                GenerationState::Completed | GenerationState::Failed | GenerationState::TimedOut,
            ) => break,
            _ => {}
        }
    }

    match session.finish().await {
        Ok(outcome) => {
            println!("\ngenerated {} files", outcome.files.len());
        }
        Err(failure) => eprintln!("\ngeneration failed: {failure}"),
    }

    heartbeat.shutdown();
    Ok(())
}
