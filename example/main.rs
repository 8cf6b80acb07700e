use dagflow::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn step(name: &str, millis: u64) -> TaskRef<u64, String> {
    let name_for_worker = name.to_string();
    Task::new(name, millis, move |_ctx, delay| {
        let name = name_for_worker.clone();
        async move {
            println!("running {name}");
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(format!("{name} done"))
        }
    })
    .build()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let manager = TaskManager::new(3)?
        .with_startup_hook(|| async {
            println!("warming up");
            Ok(())
        })
        .with_shutdown_hook(|| async {
            println!("tearing down");
            Ok(())
        });

    manager.add_task(step("fetch", 100))?;
    manager.add_task(step("parse", 50))?;
    manager.add_task(step("validate", 50))?;
    manager.add_task(step("transform", 80))?;
    manager.add_task(step("store", 60))?;

    // Flaky task: fails twice, succeeds on the third invocation.
    let attempts = Arc::new(AtomicU32::new(0));
    let report = Task::new("report", 20u64, move |_ctx, delay| {
        let attempts = attempts.clone();
        async move {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                return Err(TaskError::execution("report backend unavailable"));
            }
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok("report done".to_string())
        }
    })
    .with_retry_policy(RetryPolicy::fixed(Duration::from_millis(25), 3))
    .with_priority(10)
    .build();
    manager.add_task(report.clone())?;

    manager.add_dependency("parse", "fetch")?;
    manager.add_dependency("validate", "fetch")?;
    manager.add_dependency("transform", "parse")?;
    manager.add_dependency("transform", "validate")?;
    manager.add_dependency("store", "transform")?;
    manager.add_dependency("report", "store")?;

    println!("=== dependency graph ===");
    print!("{}", manager.graph());

    println!("=== executing ===");
    let start = std::time::Instant::now();
    manager.run(CancellationToken::new()).await?;
    println!("=== finished in {:?} ===", start.elapsed());

    println!("order: {:?}", manager.execution_order());
    println!(
        "report: {:?} after {} retries -> {:?}",
        manager.task_state("report"),
        report.retry_count(),
        report.result()
    );

    Ok(())
}
