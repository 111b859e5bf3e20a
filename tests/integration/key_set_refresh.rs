//! Key-set cache behaviour against a live HTTP source.

// std
use std::{sync::Arc, time::Duration};
// crates.io
use futures::future;
use labid::{Error, KeySetCache, Result};
use wiremock::{
	Mock, MockServer, ResponseTemplate,
	matchers::{header, method, path},
};
// self
use crate::common::{self, Platform};

async fn received(server: &MockServer) -> usize {
	server.received_requests().await.map_or(0, |requests| requests.len())
}

#[tokio::test]
async fn caches_key_set_after_initial_fetch() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();
	let server = MockServer::start().await;
	let platform = Platform::new(1);

	Mock::given(method("GET"))
		.and(path(common::JWKS_PATH))
		.respond_with(common::jwks_response(&platform))
		.expect(1)
		.mount(&server)
		.await;

	let cache = KeySetCache::new(common::key_source(&server))?;
	let first = cache.lookup().await?;
	let second = cache.lookup().await?;

	assert_eq!(first.keys.len(), 1);
	assert!(first.find(platform.keys.kid()).is_some());
	assert!(Arc::ptr_eq(&first, &second));

	let metrics = cache.metrics().snapshot();

	assert_eq!(metrics.total_requests, 2);
	assert_eq!(metrics.cache_hits, 1);
	assert_eq!(metrics.refresh_successes, 1);

	server.verify().await;

	Ok(())
}

#[tokio::test]
async fn concurrent_cold_lookups_share_one_fetch() -> Result<()> {
	let server = MockServer::start().await;
	let platform = Platform::new(1);

	Mock::given(method("GET"))
		.and(path(common::JWKS_PATH))
		.respond_with(common::jwks_response(&platform).set_delay(Duration::from_millis(200)))
		.expect(1)
		.mount(&server)
		.await;

	let cache = KeySetCache::new(common::key_source(&server))?;
	let sets = future::try_join_all((0..8).map(|_| cache.lookup())).await?;

	assert!(sets.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));

	server.verify().await;

	Ok(())
}

#[tokio::test]
async fn revalidates_conditionally_and_survives_failed_refresh() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();
	let server = MockServer::start().await;
	let platform = Platform::new(1);

	Mock::given(method("GET"))
		.and(path(common::JWKS_PATH))
		.and(header("if-none-match", "\"v1\""))
		.respond_with(
			ResponseTemplate::new(304)
				.insert_header("cache-control", "public, max-age=300")
				.insert_header("etag", "\"v1\""),
		)
		.up_to_n_times(1)
		.with_priority(1)
		.mount(&server)
		.await;
	Mock::given(method("GET"))
		.and(path(common::JWKS_PATH))
		.respond_with(common::jwks_response(&platform))
		.up_to_n_times(1)
		.with_priority(2)
		.mount(&server)
		.await;
	Mock::given(method("GET"))
		.and(path(common::JWKS_PATH))
		.respond_with(ResponseTemplate::new(500))
		.with_priority(3)
		.mount(&server)
		.await;

	let cache = KeySetCache::new(common::key_source(&server))?;
	let first = cache.lookup().await?;

	cache.refresh().await?;

	let second = cache.lookup().await?;

	assert!(Arc::ptr_eq(&first, &second), "304 keeps the cached set");

	let err = cache.refresh().await.unwrap_err();

	assert!(matches!(err, Error::HttpStatus { .. }), "{err:?}");

	let third = cache.lookup().await?;
	let status = cache.status().await;

	assert!(Arc::ptr_eq(&first, &third), "failed refresh keeps the last good set");
	assert!(status.error_count >= 1);
	assert_eq!(status.etag.as_deref(), Some("\"v1\""));
	assert_eq!(status.key_ids, vec![platform.keys.kid().to_owned()]);
	assert!(!status.stale);

	Ok(())
}

#[tokio::test]
async fn unreachable_source_without_cached_set_is_unavailable() -> Result<()> {
	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path(common::JWKS_PATH))
		.respond_with(ResponseTemplate::new(502))
		.mount(&server)
		.await;

	let cache = KeySetCache::new(common::key_source(&server))?;
	let err = cache.lookup().await.unwrap_err();

	assert!(matches!(err, Error::KeySourceUnavailable(_)), "{err:?}");
	// One initial attempt plus one retry.
	assert_eq!(received(&server).await, 2);
	assert_eq!(cache.status().await.state, "empty");

	Ok(())
}

#[tokio::test]
async fn oversized_key_sets_are_refused() -> Result<()> {
	let server = MockServer::start().await;

	common::serve_jwks(&server, &Platform::new(1)).await;

	let mut source = common::key_source(&server);

	source.max_response_bytes = 32;

	let cache = KeySetCache::new(source)?;
	let err = cache.lookup().await.unwrap_err();

	match err {
		Error::KeySourceUnavailable(inner) => assert!(
			matches!(*inner, Error::Validation { field: "max_response_bytes", .. }),
			"{inner:?}"
		),
		other => panic!("unexpected error {other:?}"),
	}

	Ok(())
}

#[tokio::test]
async fn background_refresher_runs_until_shut_down() -> Result<()> {
	let server = MockServer::start().await;

	common::serve_jwks(&server, &Platform::new(1)).await;

	let cache = KeySetCache::new(common::key_source(&server))?;

	cache.prime().await?;

	let refresher = cache.spawn_refresher();

	tokio::task::yield_now().await;

	// Jump past the refresh point without waiting for it in real time.
	tokio::time::pause();
	tokio::time::advance(Duration::from_secs(280)).await;
	tokio::time::resume();

	for _ in 0..100 {
		if received(&server).await >= 2 {
			break;
		}

		tokio::time::sleep(Duration::from_millis(50)).await;
	}

	assert_eq!(received(&server).await, 2);
	assert!(!refresher.is_finished());

	refresher.shutdown().await;

	Ok(())
}
