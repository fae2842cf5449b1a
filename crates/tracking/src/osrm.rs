//! OSRM-backed [`RoutingService`].

use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use http::Method;
use http::header::ACCEPT;
use realtime::{Coordinates, HttpRequest, Result, bad_gateway};
use serde::Deserialize;
use tracing::debug;

use crate::route_metrics::{RouteSummary, RoutingService};

/// Driving-profile routes from an OSRM server.
pub struct OsrmClient<H> {
    http: Arc<H>,
    base_url: String,
}

impl<H: HttpRequest> OsrmClient<H> {
    pub fn new(http: Arc<H>, base_url: impl Into<String>) -> Self {
        Self { http, base_url: base_url.into() }
    }

    fn route_url(&self, origin: Coordinates, destination: Coordinates) -> String {
        format!(
            "{}/route/v1/driving/{},{};{},{}?overview=false",
            self.base_url.trim_end_matches('/'),
            origin.longitude,
            origin.latitude,
            destination.longitude,
            destination.latitude
        )
    }
}

#[derive(Debug, Deserialize)]
struct RouteResponse {
    code: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    routes: Vec<Route>,
}

#[derive(Debug, Deserialize)]
struct Route {
    distance: f64,
    duration: f64,
}

impl<H: HttpRequest> RoutingService for OsrmClient<H> {
    async fn route(
        &self, origin: Coordinates, destination: Coordinates,
    ) -> Result<Option<RouteSummary>> {
        let request = http::Request::builder()
            .method(Method::GET)
            .uri(self.route_url(origin, destination))
            .header(ACCEPT, "application/json")
            .body(Bytes::new())
            .context("building route request")?;

        let response = self.http.fetch(request).await.context("requesting route")?;
        let status = response.status();
        let body = response.into_body();

        // OSRM reports "no route" with a 4xx status and a JSON body
        let parsed = match serde_json::from_slice::<RouteResponse>(&body) {
            Ok(parsed) => parsed,
            Err(_) if !status.is_success() => {
                return Err(bad_gateway!("routing service returned {status}"));
            }
            Err(e) => return Err(e.into()),
        };
        summarise(parsed)
    }
}

fn summarise(response: RouteResponse) -> Result<Option<RouteSummary>> {
    match response.code.as_str() {
        "Ok" => Ok(response.routes.first().map(|route| RouteSummary {
            distance_m: route.distance,
            duration_s: route.duration,
        })),
        "NoRoute" | "NoSegment" => {
            debug!(code = %response.code, "no viable route");
            Ok(None)
        }
        code => Err(bad_gateway!(
            "routing service answered {code}: {}",
            response.message.unwrap_or_default()
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use http::{Request, Response, StatusCode};
    use realtime::Error;

    use super::*;

    struct Canned {
        status: StatusCode,
        body: &'static str,
        seen: Mutex<Vec<String>>,
    }

    impl Canned {
        fn new(status: StatusCode, body: &'static str) -> Arc<Self> {
            Arc::new(Self { status, body, seen: Mutex::new(Vec::new()) })
        }
    }

    impl HttpRequest for Canned {
        async fn fetch(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
            self.seen.lock().unwrap().push(request.uri().to_string());
            Ok(Response::builder()
                .status(self.status)
                .body(Bytes::from_static(self.body.as_bytes()))
                .unwrap())
        }
    }

    const VEHICLE: Coordinates = Coordinates::new(12.9, 80.2);
    const CAMPUS: Coordinates = Coordinates::new(12.957_952, 80.160_793);

    #[tokio::test]
    async fn parses_first_route() {
        let http = Canned::new(
            StatusCode::OK,
            r#"{"code":"Ok","routes":[{"distance":4260.4,"duration":629.1},{"distance":9000,"duration":900}]}"#,
        );
        let client = OsrmClient::new(Arc::clone(&http), "https://router.example/");

        let summary = client.route(VEHICLE, CAMPUS).await.expect("route").expect("summary");
        assert_eq!(summary, RouteSummary { distance_m: 4260.4, duration_s: 629.1 });
        assert_eq!(
            http.seen.lock().unwrap()[0],
            "https://router.example/route/v1/driving/80.2,12.9;80.160793,12.957952?overview=false"
        );
    }

    #[tokio::test]
    async fn empty_or_no_route_is_none() {
        let empty = Canned::new(StatusCode::OK, r#"{"code":"Ok","routes":[]}"#);
        let client = OsrmClient::new(empty, "https://router.example");
        assert_eq!(client.route(VEHICLE, CAMPUS).await.expect("route"), None);

        let no_route = Canned::new(
            StatusCode::BAD_REQUEST,
            r#"{"code":"NoRoute","message":"Impossible route between points"}"#,
        );
        let client = OsrmClient::new(no_route, "https://router.example");
        assert_eq!(client.route(VEHICLE, CAMPUS).await.expect("route"), None);
    }

    #[tokio::test]
    async fn upstream_failures_are_bad_gateway() {
        let throttled = Canned::new(StatusCode::TOO_MANY_REQUESTS, "slow down");
        let client = OsrmClient::new(throttled, "https://router.example");
        let err = client.route(VEHICLE, CAMPUS).await.unwrap_err();
        assert!(matches!(err, Error::BadGateway(_)));
        assert!(err.is_transient());

        let invalid = Canned::new(
            StatusCode::BAD_REQUEST,
            r#"{"code":"InvalidQuery","message":"Query string malformed"}"#,
        );
        let client = OsrmClient::new(invalid, "https://router.example");
        assert!(matches!(client.route(VEHICLE, CAMPUS).await, Err(Error::BadGateway(_))));

        let garbled = Canned::new(StatusCode::OK, "<html>");
        let client = OsrmClient::new(garbled, "https://router.example");
        assert!(matches!(client.route(VEHICLE, CAMPUS).await, Err(Error::InvalidFormat(_))));
    }
}
