#![allow(dead_code)]

pub mod servers;
pub mod tls;

use std::sync::Arc;

use servers::{Handler, Recorded, Reply};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("mimic=debug").try_init();
}

pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&Recorded) -> Reply + Send + Sync + 'static,
{
    Arc::new(f)
}
