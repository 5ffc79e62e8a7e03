use clap::Parser;
use pipeline_autoscaler::conf::FileSettings;
use pipeline_autoscaler::libs::backends::{
    ApiRunStore, Backends, CommandCloud, DryRunCloud, DryRunCluster, DryRunStore, K8s,
};
use pipeline_autoscaler::libs::{LeaseLock, LocalLock};
use pipeline_autoscaler::{Autoscaler, Conf, Error};
use std::sync::Arc;

mod args;

/// Wire an autoscaler to either a real or a pretend cluster
///
/// # Arguments
///
/// * `args` - The command line args
/// * `conf` - The autoscaler config
async fn build(args: &args::Args, conf: Conf) -> Result<Autoscaler, Error> {
    // reload our cluster settings from disk every cycle
    let settings = Box::new(FileSettings::new(args.config.clone()));
    if args.dry_run {
        let cluster = DryRunCluster::default();
        let cloud = DryRunCloud::new(&cluster);
        let backends = Backends::new(
            Arc::new(cluster),
            Arc::new(cloud),
            Arc::new(DryRunStore::default()),
        );
        let lock = Box::new(LocalLock::default());
        return Ok(Autoscaler::new(conf.autoscaler, settings, backends, lock));
    }
    // connect to k8s
    let k8s = K8s::new(&conf.k8s).await?;
    let lock = Box::new(LeaseLock::new(
        k8s.client(),
        &conf.k8s.namespace,
        &conf.k8s.lease,
    ));
    let backends = Backends::new(
        Arc::new(k8s),
        Arc::new(CommandCloud::new(conf.cloud.clone())),
        Arc::new(ApiRunStore::new(&conf.api)?),
    );
    Ok(Autoscaler::new(conf.autoscaler, settings, backends, lock))
}

/// The pipeline autoscaler
#[tokio::main]
async fn main() {
    // install a crypto provider for rustls
    // Rustls will complain if this is not run but we can ignore any errors
    // https://github.com/rustls/rustls/issues/1938
    let _ = rustls::crypto::ring::default_provider().install_default();
    // get command line args
    let args = args::Args::parse();
    // try to load a config file
    let conf = Conf::new(&args.config).expect("Failed to load config");
    // setup our tracer
    pipeline_autoscaler::trace::setup("PipelineAutoscaler", &conf.tracing)
        .expect("Failed to setup tracing");
    // setup autoscaler
    let autoscaler = build(&args, conf)
        .await
        .expect("Autoscaler failed to initalize");
    // run one cycle or scale forever
    if args.once {
        autoscaler.single_loop().await.expect("Scaling cycle failed");
    } else {
        autoscaler.start().await;
    }
}
