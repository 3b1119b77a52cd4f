use std::sync::Arc;

use appgen_client::prelude::*;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), appgen_client::ApiError> {
    appgen_client::init_observability();

    let client = Arc::new(Client::new(
        ClientConfig::from_env()?,
        StaticToken::new(std::env::var("APPGEN_TOKEN").unwrap_or_default()),
    )?);

    let requirement = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "a todo list app with reminders".to_string());
    let job = client.submit_job(SubmitJobRequest::new(requirement)).await?;
    println!("submitted job {}", job.job_id);

    let subscriber = JobLogSubscriber::new(client.clone(), client.clone());
    let mut logs = subscriber.subscribe(job.job_id);
    while let Some(event) = logs.next_event().await {
        match event {
            JobLogEvent::Log(entry) => println!("{}", entry.message),
            JobLogEvent::State(SubscriberState::Reconnecting { attempt, delay }) => {
                eprintln!("reconnecting (attempt {attempt}) in {delay:?}");
            }
            JobLogEvent::Failed(failure) => eprintln!("stream failed: {failure}"),
            JobLogEvent::State(SubscriberState::Closed(_)) => break,
            _ => {}
        }
    }
    Ok(())
}
