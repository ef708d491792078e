// src/main.rs

use chrono::{DateTime, Utc};
use clap::Parser;
use rand::Rng;
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use std::error::Error;

const CLOUDEVENTS_CONTENT_TYPE: &str = "application/cloudevents+json";

#[derive(Parser, Debug)]
#[command(name = "clockbot-trigger", about = "Sends one CloudEvent to a clockbot endpoint")]
struct Args {
    #[arg(long, default_value = "http://localhost:8080/")]
    url: String,
    #[arg(long, default_value = "testing")]
    source: String,
    #[arg(long = "event-type", default_value = "testing")]
    event_type: String,
}

/// Structured-mode CloudEvent envelope.
#[derive(Debug, Serialize)]
struct CloudEvent {
    specversion: &'static str,
    id: String,
    source: String,
    #[serde(rename = "type")]
    event_type: String,
    time: DateTime<Utc>,
    datacontenttype: &'static str,
    data: String,
}

impl CloudEvent {
    fn new(source: &str, event_type: &str) -> Self {
        Self {
            specversion: "1.0",
            id: rand::thread_rng().gen::<u64>().to_string(),
            source: source.to_string(),
            event_type: event_type.to_string(),
            time: Utc::now(),
            datacontenttype: "text/plain",
            data: "testing".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TriggerResponse {
    success: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let event = CloudEvent::new(&args.source, &args.event_type);
    let client = Client::new();

    println!("Sending event {} ({}) to {}", event.id, event.event_type, args.url);
    let response = client
        .post(&args.url)
        .header(header::CONTENT_TYPE, CLOUDEVENTS_CONTENT_TYPE)
        .json(&event)
        .send()
        .await?;

    let status = response.status();
    let body = response.text().await?;
    println!("Status: {}", status);
    println!("Body: {}", body);

    match serde_json::from_str::<TriggerResponse>(&body) {
        Ok(reply) if reply.success => println!("Check succeeded"),
        Ok(_) => println!("Check reported failure"),
        Err(_) => println!("Reply is not a clockbot response"),
    }
    Ok(())
}
