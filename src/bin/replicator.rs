use chrono::Local;
use clap::Parser;
use mongo_repl::{
    sync_namespace_spec_for_sharding, CheckpointDoc, CheckpointManager, CheckpointProvider,
    DdlManager, DirectApplier, DocumentSyncer, MongoCheckpointStorage, MongoOplogSource,
    NoopMoveChunkManager, OplogReader, OplogSyncer, SimpleRateController, SyncerConfig, Worker,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(version, author, about = "MongoDB oplog replicator")]
struct Opts {
    /// replicator configuration file (toml).
    #[arg(short, long)]
    config: PathBuf,
    /// log file path; if not specified, all log output goes to stdout.
    #[arg(long)]
    log_path: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opts: Opts = Opts::parse();
    let collector = tracing_subscriber::fmt();
    let (non_blocking, _guard) = match &opts.log_path {
        Some(path) => {
            let dir_name = path.parent().unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("replicator.log");
            let file_appender = tracing_appender::rolling::daily(dir_name, file_name);
            tracing_appender::non_blocking(file_appender)
        }
        None => tracing_appender::non_blocking(std::io::stdout()),
    };
    collector.with_writer(non_blocking).init();

    let conf = Arc::new(SyncerConfig::from_toml(&std::fs::read_to_string(
        &opts.config,
    )?)?);

    let storage = MongoCheckpointStorage::new(conf.checkpoint_url(), conf.checkpoint_db())?;
    let ckpt_manager = Arc::new(CheckpointManager::new(
        Box::new(storage),
        conf.checkpoint_interval_ms(),
    ));
    let ddl_manager = Arc::new(DdlManager::new(
        conf.replsets().len(),
        conf.target_is_sharding(),
        conf.config_server_url(),
    )?);
    let rate = Arc::new(SimpleRateController::new());
    // this reference coordinator always holds the master lease; a real
    // deployment flips the flag from its election loop
    let master = Arc::new(AtomicBool::new(true));

    let mut spec_synced = false;
    let mut syncers = Vec::new();
    let mut providers: Vec<Arc<dyn CheckpointProvider>> = Vec::new();
    for (index, replset) in conf.replsets().iter().enumerate() {
        let checkpoint = ckpt_manager.load(&replset.name)?;
        let doc_end_ts = if checkpoint.ack_ts == 0 {
            // fresh start: run the document phase first, then tail from
            // its end position
            if conf.target_is_sharding() && !spec_synced {
                if let Some(cs_url) = conf.config_server_url() {
                    let target = mongodb::sync::Client::with_uri_str(conf.target_url())?;
                    sync_namespace_spec_for_sharding(cs_url, &target)?;
                    spec_synced = true;
                }
            }
            info!(replset = %replset.name, "no checkpoint found, document phase begin");
            let doc_syncer = DocumentSyncer::new(index, &replset.url, conf.clone())?;
            let end_ts = doc_syncer.start()?;
            ckpt_manager.store(&CheckpointDoc {
                name: replset.name.clone(),
                ack_ts: end_ts,
                sync_ts: end_ts,
                dq_name: None,
            })?;
            end_ts
        } else {
            checkpoint.ack_ts
        };

        let source = MongoOplogSource::new(&replset.url)?;
        let reader = Arc::new(OplogReader::new(
            Box::new(source),
            conf.log_directory().to_path_buf(),
        ));
        let syncer = Arc::new(OplogSyncer::new(
            conf.clone(),
            &replset.name,
            reader,
            doc_end_ts,
            ckpt_manager.clone(),
            ddl_manager.clone(),
            Arc::new(NoopMoveChunkManager),
            rate.clone(),
        )?);

        for worker_id in 0..conf.worker_count() {
            let (worker, batch_rx) = Worker::new(worker_id);
            let worker = Arc::new(worker);
            syncer.bind(worker.clone());
            let _applier = DirectApplier::new(conf.target_url(), worker, syncer.metric().clone())?
                .start(batch_rx);
        }

        let checkpoint = ckpt_manager.load(&replset.name)?;
        syncer.load_by_doc(&checkpoint, Local::now())?;
        providers.push(syncer.clone());
        syncers.push(syncer);
    }

    ckpt_manager.start_flusher(providers);

    let mut handles = Vec::new();
    for syncer in syncers {
        let master = master.clone();
        let name = format!("syncer-{}", syncer.replset());
        handles.push(
            std::thread::Builder::new()
                .name(name)
                .spawn(move || syncer.start(master))?,
        );
    }
    for handle in handles {
        let _ = handle.join();
    }
    Ok(())
}
