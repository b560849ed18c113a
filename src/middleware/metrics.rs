use crate::state::AppState;
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    web, Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};

/// Path segments that are followed by a session id.
const ID_PARENTS: [&str; 3] = ["sessions", "audio", "ws"];

/// Counts requests and times them per endpoint.
pub struct MetricsMiddleware;

impl<S, B> Transform<S, ServiceRequest> for MetricsMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = MetricsMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MetricsMiddlewareService { service }))
    }
}

pub struct MetricsMiddlewareService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for MetricsMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let start_time = Instant::now();
        let endpoint = format!("{} {}", req.method(), normalize_path(req.uri().path()));
        let app_state = req.app_data::<web::Data<AppState>>().cloned();

        if let Some(app_state) = &app_state {
            app_state.increment_request_count();
        }

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let duration_ms = start_time.elapsed().as_millis() as u64;

            let is_error = match &result {
                Ok(response) => {
                    response.status().is_client_error() || response.status().is_server_error()
                }
                Err(_) => true,
            };

            if let Some(app_state) = app_state {
                app_state.record_endpoint_request(&endpoint, duration_ms, is_error);
                if is_error {
                    app_state.increment_error_count();
                }
            }

            result
        })
    }
}

/// Collapse session ids so every session shares one metrics key,
/// e.g. `/api/v1/sessions/session_ab12/status` → `/api/v1/sessions/{id}/status`.
pub fn normalize_path(path: &str) -> String {
    let mut previous = "";
    path.split('/')
        .map(|segment| {
            let normalized = if ID_PARENTS.contains(&previous) && !segment.is_empty() {
                "{id}"
            } else {
                segment
            };
            previous = segment;
            normalized
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::state::tests::test_state;
    use actix_web::{test as actix_test, App, HttpResponse};

    #[test]
    fn test_normalize_path() {
        assert_eq!(
            normalize_path("/api/v1/sessions/session_ab12/status"),
            "/api/v1/sessions/{id}/status"
        );
        assert_eq!(normalize_path("/api/v1/audio/session_ab12"), "/api/v1/audio/{id}");
        assert_eq!(normalize_path("/ws/session_ab12"), "/ws/{id}");
        assert_eq!(normalize_path("/api/v1/sessions"), "/api/v1/sessions");
        assert_eq!(normalize_path("/api/v1/sessions/"), "/api/v1/sessions/");
        assert_eq!(normalize_path("/health"), "/health");
    }

    #[actix_web::test]
    async fn test_requests_are_recorded() {
        let state = web::Data::new(test_state(AppConfig::default()));
        let app = actix_test::init_service(
            App::new()
                .app_data(state.clone())
                .wrap(MetricsMiddleware)
                .route("/ok", web::get().to(|| async { HttpResponse::Ok().finish() }))
                .route(
                    "/sessions/{id}",
                    web::get().to(|| async { HttpResponse::NotFound().finish() }),
                ),
        )
        .await;

        actix_test::call_service(&app, actix_test::TestRequest::get().uri("/ok").to_request()).await;
        for id in ["a", "b"] {
            let req = actix_test::TestRequest::get().uri(&format!("/sessions/{}", id)).to_request();
            actix_test::call_service(&app, req).await;
        }

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.request_count, 3);
        assert_eq!(metrics.error_count, 2);
        let sessions = &metrics.endpoint_metrics["GET /sessions/{id}"];
        assert_eq!(sessions.request_count, 2);
        assert_eq!(sessions.error_rate(), 1.0);
    }
}
