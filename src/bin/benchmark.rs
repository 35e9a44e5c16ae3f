//! Load generator for the inference gateway
//!
//! Usage: cargo run --release --bin benchmark -- --target http://localhost:8000

use std::time::Instant;

use clap::Parser;
use infermesh::utils::LatencyTracker;
use infermesh::InferRequest;
use rand::Rng;
use reqwest::Client;
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Flattened 224x224x3 image, matching the synthetic model's input.
const INPUT_SIZE: usize = 224 * 224 * 3;

#[derive(Debug, Parser)]
#[command(name = "benchmark", about = "Load generator for distributed inference")]
struct Args {
    /// Target gateway URL
    #[arg(long, default_value = "http://localhost:8000")]
    target: String,

    /// Total number of requests
    #[arg(long, default_value_t = 1000)]
    requests: usize,

    /// Concurrent requests per wave
    #[arg(long, default_value_t = 50)]
    concurrent: usize,
}

fn generate_request(req_id: usize) -> InferRequest {
    let mut rng = rand::thread_rng();
    InferRequest {
        request_id: format!("req_{}", req_id),
        model_name: "resnet50".to_string(),
        input_data: (0..INPUT_SIZE).map(|_| rng.gen::<f32>()).collect(),
        input_shape: vec![1, 224, 224, 3],
        timestamp: std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let client = Client::new();

    println!("=== Infermesh Benchmark ===\n");
    println!("Target: {}", args.target);

    // Fail early when the gateway is unreachable.
    match client
        .get(format!("{}/stats", args.target))
        .send()
        .await
        .and_then(|r| r.error_for_status())
    {
        Ok(response) => {
            let stats: Value = response.json().await?;
            println!("Gateway is accessible");
            println!(
                "Workers: {}",
                stats.get("num_workers").and_then(Value::as_u64).unwrap_or(0)
            );
        }
        Err(e) => {
            eprintln!("Cannot connect to gateway: {}", e);
            eprintln!("Make sure the gateway is running on {}", args.target);
            std::process::exit(1);
        }
    }

    println!(
        "\nStarting load test: {} requests with {} concurrent\n",
        args.requests, args.concurrent
    );

    let mut tracker = LatencyTracker::new();
    let started = Instant::now();
    let mut sent = 0usize;

    while sent < args.requests {
        let wave = args.concurrent.min(args.requests - sent);
        let mut handles = Vec::with_capacity(wave);

        for i in 0..wave {
            let client = client.clone();
            let url = format!("{}/infer", args.target);
            let request = generate_request(sent + i);

            handles.push(tokio::spawn(async move {
                let request_start = Instant::now();
                let result = client.post(&url).json(&request).send().await;
                match result {
                    Ok(response) if response.status().is_success() => {
                        let node_id = response
                            .json::<Value>()
                            .await
                            .ok()
                            .and_then(|body| {
                                body.get("node_id").and_then(Value::as_str).map(str::to_owned)
                            })
                            .unwrap_or_else(|| "unknown".to_string());
                        Ok((request_start.elapsed(), node_id))
                    }
                    Ok(response) => Err(format!("status {}", response.status())),
                    Err(e) => Err(e.to_string()),
                }
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(Ok((latency, node_id))) => tracker.record_success(latency, &node_id),
                Ok(Err(_)) | Err(_) => tracker.record_failure(),
            }
        }

        sent += wave;
        let elapsed = started.elapsed().as_secs_f64();
        let throughput = if elapsed > 0.0 {
            sent as f64 / elapsed
        } else {
            0.0
        };
        print!(
            "\rProgress: {}/{} ({:.1} req/s)",
            sent, args.requests, throughput
        );
        std::io::Write::flush(&mut std::io::stdout()).ok();
    }

    println!("\n");

    let report = tracker.finalize();
    report.display();

    std::fs::write("benchmark_results.json", report.to_json())?;
    println!("Results exported to benchmark_results.json");

    Ok(())
}
