use std::sync::Arc;

use controller::acl::Acl;
use controller::config::Config;
use controller::handlers::{LogLevelHandler, StatsHandler, Stats, StopHandler};
use controller::request::Handler;
use controller::router::Router;
use controller::server::Controller;
use controller::shutdown::Shutdown;
use fdpool::pool::Pool;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    simple_logger::init_with_level(config.log.level.as_level())?;

    let pool = Arc::new(Pool::new());
    let stats = Arc::new(Stats::default());
    let shutdown = Arc::new(Shutdown::new());

    let mut router: Router<Arc<dyn Handler>> = Router::new();
    router.register(
        "/stats",
        Arc::new(StatsHandler {
            stats: stats.clone(),
            pool: pool.clone(),
        }),
    )?;
    router.register("/loglevel", Arc::new(LogLevelHandler))?;
    router.register(
        "/stop",
        Arc::new(StopHandler {
            shutdown: shutdown.clone(),
        }),
    )?;

    let acl = Acl::new(
        config.acl.disabled,
        config.acl.rules.clone(),
        config.tls.enabled,
        config.tls.ca.is_some(),
    );

    let tls_acceptor = if config.tls.enabled {
        let cert = config
            .tls
            .cert
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("tls.enabled requires tls.cert"))?;
        let key = config
            .tls
            .key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("tls.enabled requires tls.key"))?;
        Some(controller::tls::build_acceptor(
            cert,
            key,
            config.tls.ca.as_deref(),
        )?)
    } else {
        None
    };

    let ctrl = Arc::new(Controller::new(
        config.listen.bind,
        config.listen.workers,
        router,
        acl,
        stats,
        shutdown,
        tls_acceptor,
    ));

    ctrl.run().await
}
