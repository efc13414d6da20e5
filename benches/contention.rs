use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_postgres::{Client, Config, NoTls};
use ulid::Ulid;

struct Target {
    host: String,
    port: u16,
    operator: String,
    password: String,
}

async fn connect(target: &Target, market: &str, user: &str) -> Client {
    let mut config = Config::new();
    config
        .host(&target.host)
        .port(target.port)
        .dbname(market)
        .user(user)
        .password(&target.password);

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

fn sqlstate(err: &tokio_postgres::Error) -> String {
    err.as_db_error()
        .map(|e| e.code().code().to_string())
        .unwrap_or_else(|| "?".into())
}

struct Market {
    name: String,
    pid: Ulid,
    pro_user: Ulid,
    clients: Vec<Ulid>,
}

/// One professional with a 00:00-23:00 day and `n_clients` registered clients.
async fn setup(target: &Target, n_clients: usize) -> Market {
    let name = format!("bench_{}", Ulid::new()).to_lowercase();
    let operator = connect(target, &name, &target.operator).await;

    let pro_user = Ulid::new();
    let pid = Ulid::new();
    operator
        .batch_execute(&format!(
            "INSERT INTO users VALUES ('{pro_user}', 'PROFESSIONAL');
             INSERT INTO professionals VALUES ('{pid}', '{pro_user}', 'Bench')"
        ))
        .await
        .unwrap();

    let mut clients = Vec::with_capacity(n_clients);
    for _ in 0..n_clients {
        let id = Ulid::new();
        operator
            .batch_execute(&format!("INSERT INTO users VALUES ('{id}', 'USER')"))
            .await
            .unwrap();
        clients.push(id);
    }

    let pro = connect(target, &name, &pro_user.to_string()).await;
    pro.batch_execute(
        "INSERT INTO availability (date, start_time, end_time) VALUES ('2025-12-18', '00:00', '23:00')",
    )
    .await
    .unwrap();

    Market { name, pid, pro_user, clients }
}

fn booking_sql(pid: Ulid, hour: usize) -> String {
    format!(
        "INSERT INTO appointments (professional_id, date, start_time, end_time) \
         VALUES ('{pid}', '2025-12-18', '{hour:02}:00', '{:02}:00')",
        hour + 1
    )
}

/// Every client races for the same hour. Exactly one should win.
async fn phase1_same_slot(target: Arc<Target>) {
    let market = Arc::new(setup(&target, 64).await);
    let won = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for &user in &market.clients {
        let target = target.clone();
        let market = market.clone();
        let won = won.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&target, &market.name, &user.to_string()).await;
            let t = Instant::now();
            match client.batch_execute(&booking_sql(market.pid, 12)).await {
                Ok(()) => {
                    won.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) if ["23P01", "40001"].contains(&sqlstate(&e).as_str()) => {}
                Err(e) => eprintln!("unexpected error: {e}"),
            }
            t.elapsed()
        }));
    }

    let mut latencies = Vec::new();
    for h in handles {
        latencies.push(h.await.unwrap());
    }
    println!(
        "  {} clients, {} winner(s) in {:.2}s",
        market.clients.len(),
        won.load(Ordering::Relaxed),
        start.elapsed().as_secs_f64()
    );
    print_latency("booking latency", &mut latencies);
}

/// Clients spread over the day, each trying every hour from its own offset.
async fn phase2_fill_day(target: Arc<Target>) {
    let market = Arc::new(setup(&target, 23).await);
    let won = Arc::new(AtomicUsize::new(0));
    let lost = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for (i, &user) in market.clients.iter().enumerate() {
        let target = target.clone();
        let market = market.clone();
        let won = won.clone();
        let lost = lost.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&target, &market.name, &user.to_string()).await;
            let mut latencies = Vec::with_capacity(23);
            for step in 0..23 {
                let hour = (i + step) % 23;
                let t = Instant::now();
                let result = client.batch_execute(&booking_sql(market.pid, hour)).await;
                latencies.push(t.elapsed());
                match result {
                    Ok(()) => won.fetch_add(1, Ordering::Relaxed),
                    Err(_) => lost.fetch_add(1, Ordering::Relaxed),
                };
            }
            latencies
        }));
    }

    let mut latencies = Vec::new();
    for h in handles {
        latencies.extend(h.await.unwrap());
    }
    println!(
        "  {} booked, {} rejected in {:.2}s",
        won.load(Ordering::Relaxed),
        lost.load(Ordering::Relaxed),
        start.elapsed().as_secs_f64()
    );
    print_latency("booking latency", &mut latencies);

    let pro = connect(&target, &market.name, &market.pro_user.to_string()).await;
    let rows = pro
        .simple_query("SELECT * FROM availability WHERE professional_id = 'me'")
        .await
        .unwrap();
    let open = rows
        .iter()
        .filter(|m| matches!(m, tokio_postgres::SimpleQueryMessage::Row(_)))
        .count();
    println!("  {open} open interval(s) left");
}

/// Book and cancel the same hour in a loop, exercising split and merge.
async fn phase3_churn(target: Arc<Target>) {
    let market = setup(&target, 1).await;
    let client = connect(&target, &market.name, &market.clients[0].to_string()).await;

    let n = 500;
    let mut book_latencies = Vec::with_capacity(n);
    let mut cancel_latencies = Vec::with_capacity(n);
    for i in 0..n {
        let hour = i % 23;
        let t = Instant::now();
        let rows = client.simple_query(&booking_sql(market.pid, hour)).await.unwrap();
        book_latencies.push(t.elapsed());

        // The appointment row comes first, ahead of the remaining intervals.
        let id = rows
            .iter()
            .find_map(|m| match m {
                tokio_postgres::SimpleQueryMessage::Row(r) => r.get("id"),
                _ => None,
            })
            .map(str::to_string)
            .expect("booking returned no appointment");

        let t = Instant::now();
        client
            .batch_execute(&format!("DELETE FROM appointments WHERE id = '{id}'"))
            .await
            .unwrap();
        cancel_latencies.push(t.elapsed());
    }

    print_latency("book", &mut book_latencies);
    print_latency("cancel", &mut cancel_latencies);
}

#[tokio::main]
async fn main() {
    let target = Arc::new(Target {
        host: std::env::var("SLOTBOOK_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
        port: std::env::var("SLOTBOOK_PORT")
            .unwrap_or_else(|_| "5433".into())
            .parse()
            .expect("invalid SLOTBOOK_PORT"),
        operator: std::env::var("SLOTBOOK_OPERATOR").unwrap_or_else(|_| "slotbook".into()),
        password: std::env::var("SLOTBOOK_PASSWORD").unwrap_or_else(|_| "slotbook".into()),
    });

    println!("=== slotbook contention benchmark ===");
    println!("target: {}:{}\n", target.host, target.port);

    // Each phase uses its own marketplace.

    println!("[phase 1] many clients, one slot");
    phase1_same_slot(target.clone()).await;

    println!("\n[phase 2] filling a day concurrently");
    phase2_fill_day(target.clone()).await;

    println!("\n[phase 3] book/cancel churn");
    phase3_churn(target).await;

    println!("\ndone.");
}
