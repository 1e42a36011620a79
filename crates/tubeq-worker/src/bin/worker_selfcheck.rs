use std::path::Path;

use tubeq_media::{check_ffmpeg, check_ytdlp};
use tubeq_queue::{QueueBackend, QueueConfig};
use tubeq_worker::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = WorkerConfig::from_env()?;

    println!(
        "worker-selfcheck: starting with work_dir={} output_dir={}",
        config.work_dir, config.output_dir
    );
    ensure_dir(&config.work_dir).await?;
    ensure_dir(&config.output_dir).await?;

    let ytdlp = check_ytdlp()?;
    println!("worker-selfcheck: yt-dlp at {}", ytdlp.display());
    let ffmpeg = check_ffmpeg()?;
    println!("worker-selfcheck: ffmpeg at {}", ffmpeg.display());

    if QueueConfig::from_env().backend == QueueBackend::Redis {
        ensure_env_present(&["REDIS_URL"])?;
    }

    println!("worker-selfcheck: ok");
    Ok(())
}

async fn ensure_dir<P: AsRef<Path>>(path: P) -> anyhow::Result<()> {
    let path = path.as_ref();
    tokio::fs::create_dir_all(path).await?;
    let probe = path.join(".selfcheck");
    tokio::fs::write(&probe, b"ok")
        .await
        .map_err(|e| anyhow::anyhow!("{} is not writable: {}", path.display(), e))?;
    tokio::fs::remove_file(&probe).await?;
    Ok(())
}

fn ensure_env_present(vars: &[&str]) -> anyhow::Result<()> {
    for var in vars {
        if std::env::var(var).is_err() {
            return Err(anyhow::anyhow!("missing required env var {}", var));
        }
    }
    Ok(())
}
