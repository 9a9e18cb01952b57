//! Reporting of metrics to statsd.
//!
//! Metrics are emitted with the [`metric!`](crate::metric) macro. Until [`configure_statsd`] is
//! called, which happens at most once at startup, metrics are dropped without being formatted.
use std::collections::BTreeMap;
use std::io;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::OnceLock;

use cadence::{StatsdClient, UdpMetricSink};

static METRICS_CLIENT: OnceLock<StatsdClient> = OnceLock::new();

thread_local! {
    static CURRENT_CLIENT: Option<&'static StatsdClient> = METRICS_CLIENT.get();
}

/// The metrics prelude that is necessary to use the client.
pub mod prelude {
    pub use cadence::prelude::*;
}

/// Builds a client sending to `addrs`, which attaches `tags` to every metric.
fn create_client(
    prefix: &str,
    addrs: &[std::net::SocketAddr],
    tags: BTreeMap<String, String>,
) -> io::Result<StatsdClient> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(addrs, socket).map_err(io::Error::other)?;

    let builder = tags
        .into_iter()
        .fold(StatsdClient::builder(prefix, sink), |builder, (tag, value)| {
            builder.with_tag(tag, value)
        });
    Ok(builder.build())
}

/// Tell the metrics system to report to statsd.
pub fn configure_statsd<A: ToSocketAddrs>(
    prefix: &str,
    host: A,
    tags: BTreeMap<String, String>,
) -> io::Result<()> {
    let addrs: Vec<_> = host.to_socket_addrs()?.collect();
    let Some(addr) = addrs.first() else {
        return Err(io::Error::other("statsd address does not resolve"));
    };
    tracing::info!("Reporting metrics to statsd at {}", addr);

    let client = create_client(prefix, &addrs, tags)?;
    METRICS_CLIENT
        .set(client)
        .map_err(|_| io::Error::other("statsd is already configured"))
}

/// Invoke a callback with the current statsd client.
///
/// If statsd is not configured the callback is not invoked. For the most part
/// the [`metric!`](crate::metric) macro should be used instead.
#[inline(always)]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&StatsdClient) -> R,
    R: Default,
{
    CURRENT_CLIENT.with(|client| client.map(f).unwrap_or_default())
}

/// Emits a metric.
///
/// `time_raw` sends plain numbers, like file sizes, as a statsd timer.
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send count_with_tags, $id, $value $(, $k => $v)*)
    };
    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send gauge_with_tags, $id, $value $(, $k => $v)*)
    };
    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send time_with_tags, $id, $value $(, $k => $v)*)
    };
    (time_raw($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send time_with_tags, $id, $value $(, $k => $v)*)
    };
    (histogram($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send histogram_with_tags, $id, $value $(, $k => $v)*)
    };

    (@send $method:ident, $id:expr, $value:expr $(, $k:expr => $v:expr)*) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.$method($id, $value)
                $(.with_tag($k, $v))*
                .send();
        })
    }};
}
