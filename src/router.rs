//! HTTP 与 HTTPS 监听器共用的路由表与中间件。

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::get;
use axum::{Router, middleware};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info_span};

use crate::auth::{AuthGateway, gateway_middleware};
use crate::http::{add_security_headers, build_cors_layer, resolve_client_ip};
use crate::listing::Storage;
use crate::upload::{ImageDir, UploadConfig};
use crate::{files, upload, version};

/// 在文件大小上限之外为 multipart 边界与分段头预留的空间。
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// 图片目录的列表、上传、读取与删除路由。
fn image_routes(base: &str, kind: ImageDir, body_limit: usize) -> Router {
    let collection = match kind {
        ImageDir::Uploads => get(upload::list_images)
            .post(upload::upload_image)
            .layer(DefaultBodyLimit::max(body_limit)),
        ImageDir::Screenshots => get(upload::list_images),
    };
    Router::new()
        .route(base, collection)
        .route(
            &format!("{base}/{{name}}"),
            get(upload::serve_image).delete(upload::delete_image),
        )
        .layer(Extension(kind))
}

/// 构建网关路由，`RequestScheme` 扩展由调用方按监听器添加。
pub fn build_router(
    storage: Arc<Storage>,
    upload_config: Arc<UploadConfig>,
    gateway: Arc<AuthGateway>,
    cors_origins: Option<&str>,
) -> Router {
    let body_limit = usize::try_from(upload_config.max_size)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD);
    let trust_forwarded_for = gateway.trust_forwarded_for;

    let mut app = Router::new()
        .route("/api/list", get(files::list_files))
        .route("/api/tree", get(files::file_tree))
        .route("/api/file", get(files::download_file))
        .route("/api/file/meta", get(files::file_meta))
        .route("/api/version", get(version::get_version_info))
        .merge(image_routes("/api/uploads", ImageDir::Uploads, body_limit))
        .merge(image_routes(
            "/api/screenshots",
            ImageDir::Screenshots,
            body_limit,
        ))
        .layer(middleware::from_fn(gateway_middleware))
        .layer(CatchPanicLayer::new())
        .layer(middleware::from_fn(add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(move |request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip =
                        resolve_client_ip(request.headers(), connect_ip, trust_forwarded_for)
                            .map(|ip| ip.to_string())
                            .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(storage))
        .layer(Extension(upload_config))
        .layer(Extension(gateway));

    if let Some(cors_layer) = build_cors_layer(cors_origins) {
        app = app.layer(cors_layer);
    }
    app
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{FailurePolicy, FailureStore};
    use crate::http::RequestScheme;
    use crate::sandbox::RepoRoot;
    use crate::visibility::tests::StaticOracle;
    use crate::visibility::{FailPolicy, VisibilityFilter};
    use axum::body::Body;
    use axum::http::{Method, StatusCode, Version, header};
    use axum::response::Response;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};
    use tower::ServiceExt;

    const GOOD_AUTH: &str = "Basic dXNlcjpodW50ZXIy";
    const BAD_AUTH: &str = "Basic dXNlcjp3cm9uZw==";
    const HOST: &str = "localhost:5005";
    const ORIGIN: &str = "http://localhost:5005";
    const BOUNDARY: &str = "repogate-test-boundary";

    async fn app(temp: &TempDir, secret: Option<&str>) -> Router {
        app_with(temp, secret, RequestScheme::Http, 1024 * 1024).await
    }

    async fn app_with(
        temp: &TempDir,
        secret: Option<&str>,
        scheme: RequestScheme,
        max_size: u64,
    ) -> Router {
        let root = RepoRoot::open(temp.path()).await.expect("open root");
        let visibility = VisibilityFilter::new(
            Arc::new(StaticOracle::with(&["node_modules/"])),
            Duration::from_millis(500),
            FailPolicy::Open,
        );
        let storage = Arc::new(Storage::new(root, visibility, 100));
        let upload_config = Arc::new(UploadConfig {
            upload_dir: ".uploads".into(),
            screenshot_dir: ".screenshots".into(),
            max_size,
        });
        let gateway = Arc::new(AuthGateway {
            secret: secret.map(str::to_string),
            failures: FailureStore::new(FailurePolicy {
                max_failures: 5,
                window: Duration::from_secs(300),
                block: Duration::from_secs(600),
                max_tracked: 100,
            }),
            trust_forwarded_for: false,
        });
        build_router(storage, upload_config, gateway, None).layer(Extension(scheme))
    }

    fn request(method: Method, uri: &str) -> axum::http::request::Builder {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::HOST, HOST)
            .extension(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))))
    }

    fn multipart_request(name: &str, auth: &str, parts: &[(&str, &[u8])]) -> Request<Body> {
        let mut body = Vec::new();
        for (field, bytes) in parts {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; \
                     filename=\"shot.png\"\r\nContent-Type: image/png\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        request(Method::POST, &format!("/api/uploads?name={name}"))
            .header(header::AUTHORIZATION, auth)
            .header(header::ORIGIN, ORIGIN)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .expect("upload request")
    }

    fn upload_request(name: &str, auth: &str) -> Request<Body> {
        multipart_request(name, auth, &[("file", &b"\x89PNG fake image bytes"[..])])
    }

    fn upload_dir_names(temp: &TempDir) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(temp.path().join(".uploads"))
            .expect("read uploads")
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort();
        names
    }

    async fn send(app: &Router, request: Request<Body>) -> Response {
        app.clone().oneshot(request).await.expect("router response")
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes()
            .to_vec()
    }

    #[tokio::test]
    async fn uploaded_image_round_trips_through_cache_validators() {
        let temp = tempdir().expect("tempdir");
        let app = app(&temp, Some("hunter2")).await;

        let response = send(&app, upload_request("a.png", GOOD_AUTH)).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let created: Value = serde_json::from_slice(&body_bytes(response).await).expect("json");
        assert_eq!(created["name"], "a.png");
        assert_eq!(created["path"], ".uploads/a.png");

        let response = send(
            &app,
            request(Method::GET, "/api/uploads/a.png")
                .header(header::AUTHORIZATION, GOOD_AUTH)
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::X_CONTENT_TYPE_OPTIONS),
            Some(&axum::http::HeaderValue::from_static("nosniff"))
        );
        let etag = response
            .headers()
            .get(header::ETAG)
            .cloned()
            .expect("etag header");
        assert_eq!(body_bytes(response).await, b"\x89PNG fake image bytes");

        let response = send(
            &app,
            request(Method::GET, "/api/uploads/a.png")
                .header(header::AUTHORIZATION, GOOD_AUTH)
                .header(header::IF_NONE_MATCH, etag.clone())
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(response.headers().get(header::ETAG), Some(&etag));
        assert!(body_bytes(response).await.is_empty());

        let response = send(
            &app,
            request(Method::GET, "/api/uploads")
                .header(header::AUTHORIZATION, GOOD_AUTH)
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let listing: Value = serde_json::from_slice(&body_bytes(response).await).expect("json");
        assert_eq!(listing["entries"].as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn duplicate_and_invalid_upload_names_are_rejected() {
        let temp = tempdir().expect("tempdir");
        let app = app(&temp, Some("hunter2")).await;

        let response = send(&app, upload_request("a.png", GOOD_AUTH)).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let response = send(&app, upload_request("a.png", GOOD_AUTH)).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = send(&app, upload_request("a%20b.png", GOOD_AUTH)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let response = send(&app, upload_request("notes.svg", GOOD_AUTH)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(!temp.path().join(".uploads/notes.svg").exists());
    }

    #[tokio::test]
    async fn first_recognized_field_is_stored() {
        let temp = tempdir().expect("tempdir");
        let app = app(&temp, Some("hunter2")).await;

        let parts: [(&str, &[u8]); 3] = [
            ("other", b"ignored"),
            ("image", b"legacy bytes"),
            ("file", b"current bytes"),
        ];
        let response = send(&app, multipart_request("legacy.png", GOOD_AUTH, &parts)).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            std::fs::read(temp.path().join(".uploads/legacy.png")).expect("read"),
            b"legacy bytes"
        );
        assert_eq!(upload_dir_names(&temp), vec!["legacy.png".to_string()]);
    }

    #[tokio::test]
    async fn oversized_upload_leaves_nothing_behind() {
        let temp = tempdir().expect("tempdir");
        let app = app_with(&temp, Some("hunter2"), RequestScheme::Http, 8).await;

        let small: [(&str, &[u8]); 1] = [("file", b"tiny")];
        let response = send(&app, multipart_request("a.png", GOOD_AUTH, &small)).await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let large: [(&str, &[u8]); 1] = [("file", b"thirteen byte")];
        let response = send(&app, multipart_request("b.png", GOOD_AUTH, &large)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(upload_dir_names(&temp), vec!["a.png".to_string()]);
    }

    #[tokio::test]
    async fn http2_mutation_uses_uri_authority() {
        let temp = tempdir().expect("tempdir");
        let app = app_with(&temp, Some("hunter2"), RequestScheme::Https, 1024 * 1024).await;
        std::fs::create_dir(temp.path().join(".uploads")).expect("mkdir");
        std::fs::write(temp.path().join(".uploads/a.png"), b"png").expect("write");

        let h2_delete = |origin: &'static str| {
            Request::builder()
                .method(Method::DELETE)
                .uri("https://localhost:8443/api/uploads/a.png")
                .version(Version::HTTP_2)
                .header(header::AUTHORIZATION, GOOD_AUTH)
                .header(header::ORIGIN, origin)
                .extension(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))))
                .body(Body::empty())
                .expect("request")
        };

        let response = send(&app, h2_delete("https://evil.example")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(temp.path().join(".uploads/a.png").exists());

        let response = send(&app, h2_delete("https://localhost:8443")).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(!temp.path().join(".uploads/a.png").exists());
    }

    #[tokio::test]
    async fn deleting_a_missing_image_is_not_found_every_time() {
        let temp = tempdir().expect("tempdir");
        let app = app(&temp, Some("hunter2")).await;
        std::fs::create_dir(temp.path().join(".screenshots")).expect("mkdir");

        for _ in 0..2 {
            let response = send(
                &app,
                request(Method::DELETE, "/api/screenshots/missing.png")
                    .header(header::AUTHORIZATION, GOOD_AUTH)
                    .header(header::ORIGIN, ORIGIN)
                    .body(Body::empty())
                    .expect("request"),
            )
            .await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }
    }

    #[tokio::test]
    async fn repeated_failures_block_even_the_right_password() {
        let temp = tempdir().expect("tempdir");
        let app = app(&temp, Some("hunter2")).await;

        for _ in 0..5 {
            let response = send(
                &app,
                request(Method::GET, "/api/list")
                    .header(header::AUTHORIZATION, BAD_AUTH)
                    .body(Body::empty())
                    .expect("request"),
            )
            .await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
        }

        let response = send(
            &app,
            request(Method::GET, "/api/list")
                .header(header::AUTHORIZATION, GOOD_AUTH)
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry_after: u64 = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .expect("retry-after header");
        assert!(retry_after > 0);
    }

    #[tokio::test]
    async fn cross_origin_mutation_is_forbidden() {
        let temp = tempdir().expect("tempdir");
        let app = app(&temp, Some("hunter2")).await;
        std::fs::create_dir(temp.path().join(".uploads")).expect("mkdir");
        std::fs::write(temp.path().join(".uploads/a.png"), b"png").expect("write");

        let response = send(
            &app,
            request(Method::DELETE, "/api/uploads/a.png")
                .header(header::AUTHORIZATION, GOOD_AUTH)
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = send(
            &app,
            request(Method::DELETE, "/api/uploads/a.png")
                .header(header::AUTHORIZATION, GOOD_AUTH)
                .header(header::ORIGIN, "http://evil.example")
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(temp.path().join(".uploads/a.png").exists());

        let response = send(
            &app,
            request(Method::DELETE, "/api/uploads/a.png")
                .header(header::AUTHORIZATION, GOOD_AUTH)
                .header(header::ORIGIN, ORIGIN)
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(!temp.path().join(".uploads/a.png").exists());
    }

    #[tokio::test]
    async fn listing_reports_ignored_and_hidden_entries() {
        let temp = tempdir().expect("tempdir");
        let app = app(&temp, Some("hunter2")).await;
        std::fs::create_dir(temp.path().join("node_modules")).expect("mkdir");
        std::fs::create_dir(temp.path().join("src")).expect("mkdir");
        std::fs::write(temp.path().join(".env"), b"SECRET=1").expect("write");
        std::fs::write(temp.path().join("README.md"), b"hello").expect("write");

        let response = send(
            &app,
            request(Method::GET, "/api/list")
                .header(header::AUTHORIZATION, GOOD_AUTH)
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let listing: Value = serde_json::from_slice(&body_bytes(response).await).expect("json");
        assert_eq!(listing["skippedIgnored"], 1);
        assert_eq!(listing["skippedHidden"], 1);
        let names: Vec<&str> = listing["entries"]
            .as_array()
            .expect("entries")
            .iter()
            .filter_map(|entry| entry["name"].as_str())
            .collect();
        assert_eq!(names, vec!["src", "README.md"]);

        let response = send(
            &app,
            request(Method::GET, "/api/file?path=.env")
                .header(header::AUTHORIZATION, GOOD_AUTH)
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn escaping_symlink_is_not_served() {
        let temp = tempdir().expect("tempdir");
        let outside = tempdir().expect("outside");
        std::fs::write(outside.path().join("secret.txt"), b"secret").expect("write");
        std::os::unix::fs::symlink(
            outside.path().join("secret.txt"),
            temp.path().join("link.txt"),
        )
        .expect("symlink");
        let app = app(&temp, Some("hunter2")).await;

        let response = send(
            &app,
            request(Method::GET, "/api/file?path=link.txt")
                .header(header::AUTHORIZATION, GOOD_AUTH)
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(!body_bytes(response).await.starts_with(b"secret"));
    }

    #[tokio::test]
    async fn open_access_mode_skips_the_gateway() {
        let temp = tempdir().expect("tempdir");
        let app = app(&temp, None).await;
        std::fs::write(temp.path().join("README.md"), b"hello").expect("write");

        let response = send(
            &app,
            request(Method::GET, "/api/file?path=README.md")
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"hello");

        let response = send(
            &app,
            request(Method::DELETE, "/api/uploads/missing.png")
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
