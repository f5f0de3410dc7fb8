//! The HTTP/REST front-end.
//!
//! A warp router over the server context. Every request first passes the
//! access checks (remote-access gating, basic authentication, the scripted
//! HTTP filter); errors are formatted into the JSON body described by the
//! `HttpDescribeErrors` option. Routes not handled by the built-in API fall
//! through to the plugin-registered callbacks.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use base64::Engine as _;
use serde_json::json;
use tracing::{error, info};
use warp::filters::BoxedFilter;
use warp::http::{Response, StatusCode};
use warp::path::FullPath;
use warp::{Filter, Rejection, Reply};

use crate::errors::{VaultError, VaultResult};
use crate::index::{ResourceType, StoreStatus};
use crate::server::filters::is_http_request_allowed;
use crate::server::ingest::{InstanceToStore, Origin};
use crate::server::ServerContext;
use crate::storage::FileContentKind;
use crate::VAULT_VERSION;

/// Access-control rejection: 401 asks for credentials, 403 is the scripted
/// filter's veto.
#[derive(Debug)]
struct AccessDenied {
    status: u16,
}
impl warp::reject::Reject for AccessDenied {}

type HttpResponse = Response<warp::hyper::Body>;

fn with_context(
    context: Arc<ServerContext>,
) -> impl Filter<Extract = (Arc<ServerContext>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || context.clone())
}

/// Format an error the way the REST API reports it. With
/// `HttpDescribeErrors` disabled only the status code is emitted.
fn error_response(
    context: &ServerContext,
    method: &str,
    uri: &str,
    error: &VaultError,
) -> HttpResponse {
    let (mut http_status, mut code, mut kind, mut message) = (
        error.http_status(),
        error.code(),
        error.kind_name().to_string(),
        error.to_string(),
    );

    if let VaultError::PluginDefined { code: plugin_code } = error {
        if let Some(entry) = context.plugins.lookup_error(*plugin_code) {
            http_status = entry.http_status;
            code = *plugin_code;
            kind = "Plugin".to_string();
            message = entry.message;
        }
    }

    error!("Exception in the HTTP handler: {} ({} {})", message, method, uri);

    let status = StatusCode::from_u16(http_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if !context.config.get_bool("HttpDescribeErrors", true) {
        return warp::reply::with_status(warp::reply(), status).into_response();
    }

    let body = json!({
        "Message": message,
        "Method": method,
        "Uri": uri,
        "HttpError": status.canonical_reason().unwrap_or(""),
        "HttpStatus": http_status,
        "ServerError": kind,
        "ServerStatus": code,
    });
    warp::reply::with_status(warp::reply::json(&body), status).into_response()
}

fn json_or_error<T: serde::Serialize>(
    context: &ServerContext,
    method: &str,
    uri: &str,
    result: VaultResult<T>,
) -> HttpResponse {
    match result {
        Ok(value) => warp::reply::json(&value).into_response(),
        Err(error) => error_response(context, method, uri, &error),
    }
}

fn parse_basic_auth(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

/// The access checks every request goes through before reaching a route.
fn check_access(
    context: Arc<ServerContext>,
) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    warp::method()
        .and(warp::path::full())
        .and(warp::addr::remote())
        .and(warp::header::optional::<String>("authorization"))
        .and(with_context(context))
        .and_then(
            |method: warp::http::Method,
             path: FullPath,
             addr: Option<SocketAddr>,
             auth: Option<String>,
             context: Arc<ServerContext>| async move {
                let ip = addr
                    .map(|a| a.ip().to_string())
                    .unwrap_or_else(|| "127.0.0.1".to_string());

                if !context.config.get_bool("RemoteAccessAllowed", false) {
                    let loopback = addr.map(|a| a.ip().is_loopback()).unwrap_or(true);
                    if !loopback {
                        return Err(warp::reject::custom(AccessDenied { status: 401 }));
                    }
                }

                let mut username = String::new();
                if context.config.get_bool("AuthenticationEnabled", false) {
                    let users = context.config.registered_users();
                    match auth.as_deref().and_then(parse_basic_auth) {
                        Some((user, password))
                            if users.get(&user) == Some(&password) =>
                        {
                            username = user;
                        }
                        _ => return Err(warp::reject::custom(AccessDenied { status: 401 })),
                    }
                }

                if !is_http_request_allowed(
                    &context,
                    method.as_str(),
                    path.as_str(),
                    &ip,
                    &username,
                ) {
                    return Err(warp::reject::custom(AccessDenied { status: 403 }));
                }

                Ok(())
            },
        )
        .untuple_one()
}

fn plural(kind: ResourceType) -> &'static str {
    match kind {
        ResourceType::Patient => "patients",
        ResourceType::Study => "studies",
        ResourceType::Series => "series",
        ResourceType::Instance => "instances",
    }
}

fn list_route(
    context: Arc<ServerContext>,
    kind: ResourceType,
) -> BoxedFilter<(HttpResponse,)> {
    warp::path(plural(kind))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_context(context))
        .map(move |context: Arc<ServerContext>| {
            json_or_error(
                &context,
                "GET",
                &format!("/{}", plural(kind)),
                context.index.list_resources(kind),
            )
        })
        .boxed()
}

fn get_route(context: Arc<ServerContext>, kind: ResourceType) -> BoxedFilter<(HttpResponse,)> {
    warp::path(plural(kind))
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::get())
        .and(with_context(context))
        .map(move |id: String, context: Arc<ServerContext>| {
            let uri = format!("/{}/{}", plural(kind), id);
            let result = context.index.resource_json(&id).and_then(|value| {
                // reject an id that exists at another level of the tree
                if value["Type"] == kind.name() {
                    Ok(value)
                } else {
                    Err(VaultError::UnknownResource { what: id.clone() })
                }
            });
            json_or_error(&context, "GET", &uri, result)
        })
        .boxed()
}

fn delete_route(
    context: Arc<ServerContext>,
    kind: ResourceType,
) -> BoxedFilter<(HttpResponse,)> {
    warp::path(plural(kind))
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::delete())
        .and(with_context(context))
        .map(move |id: String, context: Arc<ServerContext>| {
            let uri = format!("/{}/{}", plural(kind), id);
            let result = context.delete_resource(&id).map(|()| json!({}));
            json_or_error(&context, "DELETE", &uri, result)
        })
        .boxed()
}

/// Assemble the complete router.
pub fn build_routes(context: Arc<ServerContext>) -> BoxedFilter<(HttpResponse,)> {
    let system = warp::path!("system")
        .and(warp::get())
        .and(with_context(context.clone()))
        .map(|context: Arc<ServerContext>| {
            let body = json!({
                "Name": context.config.get_string("Name", "dicom-vault"),
                "Version": VAULT_VERSION,
                "DatabaseVersion": crate::DATABASE_SCHEMA_VERSION,
                "DicomAet": context.config.get_string("DicomAet", "VAULT"),
                "DicomPort": context.config.get_unsigned("DicomPort", 4242),
                "HttpPort": context.config.get_unsigned("HttpPort", 8042),
            });
            warp::reply::json(&body).into_response()
        });

    let statistics = warp::path!("statistics")
        .and(warp::get())
        .and(with_context(context.clone()))
        .map(|context: Arc<ServerContext>| {
            json_or_error(&context, "GET", "/statistics", context.get_statistics())
        });

    let changes = warp::path!("changes")
        .and(warp::get())
        .and(warp::query::<HashMap<String, String>>())
        .and(with_context(context.clone()))
        .map(|query: HashMap<String, String>, context: Arc<ServerContext>| {
            let since = query
                .get("since")
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0);
            let limit = query
                .get("limit")
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(100);
            let result = context.index.get_changes(since, limit).map(|(events, done)| {
                let last = events.last().map(|e| e.seq).unwrap_or(since);
                json!({
                    "Changes": events,
                    "Done": done,
                    "Last": last,
                })
            });
            json_or_error(&context, "GET", "/changes", result)
        });

    let store_instance = warp::path!("instances")
        .and(warp::post())
        .and(warp::body::bytes())
        .and(warp::addr::remote())
        .and(with_context(context.clone()))
        .map(
            |body: warp::hyper::body::Bytes,
             addr: Option<SocketAddr>,
             context: Arc<ServerContext>| {
                let ip = addr.map(|a| a.ip().to_string()).unwrap_or_default();
                let result = InstanceToStore::parse(body.to_vec(), Origin::rest_api(&ip))
                    .and_then(|instance| context.store(instance))
                    .map(|stored| {
                        json!({
                            "ID": stored.instance_id,
                            "Path": format!("/instances/{}", stored.instance_id),
                            "ParentPatient": stored.patient_id,
                            "ParentStudy": stored.study_id,
                            "ParentSeries": stored.series_id,
                            "Status": match stored.status {
                                StoreStatus::Success => "Success",
                                StoreStatus::AlreadyStored => "AlreadyStored",
                            },
                        })
                    });
                json_or_error(&context, "POST", "/instances", result)
            },
        );

    let instance_file = warp::path!("instances" / String / "file")
        .and(warp::get())
        .and(with_context(context.clone()))
        .map(|id: String, context: Arc<ServerContext>| {
            let uri = format!("/instances/{}/file", id);
            match context.read_dicom_file(&id) {
                Ok(bytes) => Response::builder()
                    .header("content-type", "application/dicom")
                    .body(warp::hyper::Body::from(bytes))
                    .expect("static response"),
                Err(error) => error_response(&context, "GET", &uri, &error),
            }
        });

    let instance_tags = warp::path!("instances" / String / "tags")
        .and(warp::get())
        .and(with_context(context.clone()))
        .map(|id: String, context: Arc<ServerContext>| {
            let uri = format!("/instances/{}/tags", id);
            let result = context
                .read_attachment(&id, FileContentKind::DicomAsJson)
                .and_then(|bytes| {
                    serde_json::from_slice::<serde_json::Value>(&bytes).map_err(Into::into)
                });
            json_or_error(&context, "GET", &uri, result)
        });

    let instance_simplified = warp::path!("instances" / String / "simplified-tags")
        .and(warp::get())
        .and(with_context(context.clone()))
        .map(|id: String, context: Arc<ServerContext>| {
            let uri = format!("/instances/{}/simplified-tags", id);
            let result = context.read_dicom_file(&id).and_then(|bytes| {
                let object = dicom_object::from_reader(&bytes[..]).map_err(|e| {
                    VaultError::DicomFormat {
                        message: e.to_string(),
                    }
                })?;
                Ok(crate::server::ingest::simplified_json(&object))
            });
            json_or_error(&context, "GET", &uri, result)
        });

    let instance_metadata = warp::path!("instances" / String / "metadata")
        .and(warp::get())
        .and(with_context(context.clone()))
        .map(|id: String, context: Arc<ServerContext>| {
            let uri = format!("/instances/{}/metadata", id);
            let result = context
                .index
                .list_metadata(&id)
                .map(|entries| entries.into_iter().map(|(kind, _)| kind).collect::<Vec<_>>());
            json_or_error(&context, "GET", &uri, result)
        });

    let instance_preview = warp::path!("instances" / String / "preview")
        .and(warp::get())
        .and(with_context(context.clone()))
        .map(|id: String, context: Arc<ServerContext>| {
            let uri = format!("/instances/{}/preview", id);
            match context.decode_frame_png(&id, 0) {
                Ok(png) => Response::builder()
                    .header("content-type", "image/png")
                    .body(warp::hyper::Body::from(png))
                    .expect("static response"),
                Err(error) => error_response(&context, "GET", &uri, &error),
            }
        });

    let get_protected = warp::path!("patients" / String / "protected")
        .and(warp::get())
        .and(with_context(context.clone()))
        .map(|id: String, context: Arc<ServerContext>| {
            let uri = format!("/patients/{}/protected", id);
            let result = context.index.is_protected(&id).map(|p| u8::from(p));
            json_or_error(&context, "GET", &uri, result)
        });

    let put_protected = warp::path!("patients" / String / "protected")
        .and(warp::put())
        .and(warp::body::bytes())
        .and(with_context(context.clone()))
        .map(
            |id: String, body: warp::hyper::body::Bytes, context: Arc<ServerContext>| {
                let uri = format!("/patients/{}/protected", id);
                let protected = matches!(
                    String::from_utf8_lossy(&body).trim(),
                    "1" | "true"
                );
                let result = context.index.set_protected(&id, protected).map(|()| json!({}));
                json_or_error(&context, "PUT", &uri, result)
            },
        );

    let reset = warp::path!("tools" / "reset")
        .and(warp::post())
        .and(with_context(context.clone()))
        .map(|context: Arc<ServerContext>| {
            context.reset();
            warp::reply::json(&json!({})).into_response()
        });

    let execute_script = warp::path!("tools" / "execute-script")
        .and(warp::post())
        .and(warp::body::bytes())
        .and(with_context(context.clone()))
        .map(|body: warp::hyper::body::Bytes, context: Arc<ServerContext>| {
            let chunk = String::from_utf8_lossy(&body).to_string();
            let result = context
                .lua
                .lock()
                .execute(&chunk)
                .map(|()| json!({}));
            json_or_error(&context, "POST", "/tools/execute-script", result)
        });

    let generate_uid = warp::path!("tools" / "generate-uid")
        .and(warp::get())
        .map(|| {
            // UUID-derived UID under the standard 2.25 root
            let uid = format!("2.25.{}", uuid::Uuid::new_v4().as_u128());
            Response::builder()
                .header("content-type", "text/plain")
                .body(warp::hyper::Body::from(uid))
                .expect("static response")
        });

    // routes registered by plugins run after every built-in route
    let plugin_routes = warp::method()
        .and(warp::path::full())
        .and(warp::body::bytes())
        .and(with_context(context.clone()))
        .and_then(
            |method: warp::http::Method,
             path: FullPath,
             body: warp::hyper::body::Bytes,
             context: Arc<ServerContext>| async move {
                match context
                    .plugins
                    .handle_rest(method.as_str(), path.as_str(), &body)
                {
                    Some(Ok(response)) => {
                        let status = StatusCode::from_u16(response.status)
                            .unwrap_or(StatusCode::OK);
                        Ok(Response::builder()
                            .status(status)
                            .header("content-type", response.content_type)
                            .body(warp::hyper::Body::from(response.body))
                            .expect("static response"))
                    }
                    Some(Err(error)) => Ok(error_response(
                        &context,
                        method.as_str(),
                        path.as_str(),
                        &error,
                    )),
                    None => Err(warp::reject::not_found()),
                }
            },
        );

    let resources = list_route(context.clone(), ResourceType::Patient)
        .or(list_route(context.clone(), ResourceType::Study))
        .or(list_route(context.clone(), ResourceType::Series))
        .or(list_route(context.clone(), ResourceType::Instance))
        .or(get_route(context.clone(), ResourceType::Patient))
        .or(get_route(context.clone(), ResourceType::Study))
        .or(get_route(context.clone(), ResourceType::Series))
        .or(get_route(context.clone(), ResourceType::Instance))
        .or(delete_route(context.clone(), ResourceType::Patient))
        .or(delete_route(context.clone(), ResourceType::Study))
        .or(delete_route(context.clone(), ResourceType::Series))
        .or(delete_route(context.clone(), ResourceType::Instance));

    let api = system
        .or(statistics)
        .or(changes)
        .or(store_instance)
        .or(instance_file)
        .or(instance_tags)
        .or(instance_simplified)
        .or(instance_metadata)
        .or(instance_preview)
        .or(get_protected)
        .or(put_protected)
        .or(reset)
        .or(execute_script)
        .or(generate_uid)
        .or(resources)
        .or(plugin_routes);

    check_access(context.clone())
        .and(api)
        .recover(handle_rejection)
        .map(|reply| Reply::into_response(reply))
        .boxed()
}

async fn handle_rejection(rejection: Rejection) -> Result<HttpResponse, Rejection> {
    if let Some(denied) = rejection.find::<AccessDenied>() {
        let response = match denied.status {
            401 => Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .header("www-authenticate", "Basic realm=\"dicom-vault\"")
                .body(warp::hyper::Body::empty()),
            _ => Response::builder()
                .status(StatusCode::FORBIDDEN)
                .body(warp::hyper::Body::empty()),
        };
        return Ok(response.expect("static response"));
    }

    if rejection.is_not_found() {
        return Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(warp::hyper::Body::empty())
            .expect("static response"));
    }

    Err(rejection)
}

/// Run the HTTP server until the context signals a stop or a reset.
pub async fn run_http_server(context: Arc<ServerContext>) -> VaultResult<()> {
    let port = context.config.get_unsigned("HttpPort", 8042) as u16;
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();

    let routes = build_routes(context.clone());
    let compressed = context.config.get_bool("HttpCompressionEnabled", true);
    let ssl = context.config.get_bool("SslEnabled", false);

    let routes: BoxedFilter<(HttpResponse,)> = if compressed {
        routes
            .with(warp::compression::gzip())
            .map(|reply| Reply::into_response(reply))
            .boxed()
    } else {
        routes
    };

    let shutdown = {
        let context = context.clone();
        async move {
            context.wait_for_exit().await;
        }
    };

    info!("HTTP server listening on port {}", port);

    if ssl {
        let certificate = context
            .config
            .get_string("SslCertificate", "certificate.pem");
        let (_, server) = warp::serve(routes)
            .tls()
            .cert_path(&certificate)
            .key_path(&certificate)
            .bind_with_graceful_shutdown(addr, shutdown);
        server.await;
    } else {
        let (_, server) = warp::serve(routes).bind_with_graceful_shutdown(addr, shutdown);
        server.await;
    }

    info!("HTTP server has stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use crate::plugins::{PluginRegistry, RestResponse};
    use dicom_core::{dicom_value, DataElement, VR};
    use dicom_dictionary_std::{tags, uids};
    use dicom_object::{FileMetaTableBuilder, InMemDicomObject};

    fn synthesize_dicom(patient: &str, study: &str, series: &str, sop: &str) -> Vec<u8> {
        let object = InMemDicomObject::from_element_iter([
            DataElement::new(tags::SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::CT_IMAGE_STORAGE)),
            DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, sop)),
            DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, dicom_value!(Str, study)),
            DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, dicom_value!(Str, series)),
            DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, patient)),
            DataElement::new(tags::MODALITY, VR::CS, dicom_value!(Str, "CT")),
        ]);
        let meta = FileMetaTableBuilder::new()
            .media_storage_sop_class_uid(uids::CT_IMAGE_STORAGE)
            .media_storage_sop_instance_uid(sop)
            .transfer_syntax("1.2.840.10008.1.2.1")
            .build()
            .unwrap();
        let mut buffer = Vec::new();
        object.with_exact_meta(meta).write_all(&mut buffer).unwrap();
        buffer
    }

    fn test_context(extra: serde_json::Value) -> (tempfile::TempDir, Arc<ServerContext>) {
        let dir = tempfile::tempdir().unwrap();
        let mut root = serde_json::json!({
            "StorageDirectory": dir.path().join("storage").display().to_string(),
            "IndexDirectory": dir.path().join("index").display().to_string(),
        });
        if let (Some(root), Some(extra)) = (root.as_object_mut(), extra.as_object()) {
            for (key, value) in extra {
                root.insert(key.clone(), value.clone());
            }
        }
        let config = Arc::new(Configuration::from_json(root).unwrap());
        let context = Arc::new(
            ServerContext::create(config, Arc::new(PluginRegistry::new()), false).unwrap(),
        );
        (dir, context)
    }

    #[tokio::test]
    async fn store_then_list_then_fetch() {
        let (_dir, context) = test_context(serde_json::json!({}));
        let routes = build_routes(context.clone());
        let buffer = synthesize_dicom("P1", "1.2.3", "1.2.3.4", "1.2.3.4.5");

        let response = warp::test::request()
            .method("POST")
            .path("/instances")
            .body(buffer.clone())
            .reply(&routes)
            .await;
        assert_eq!(response.status(), 200);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["Status"], "Success");
        let id = body["ID"].as_str().unwrap().to_string();

        // the second identical upload reports AlreadyStored with the same id
        let response = warp::test::request()
            .method("POST")
            .path("/instances")
            .body(buffer.clone())
            .reply(&routes)
            .await;
        let again: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(again["Status"], "AlreadyStored");
        assert_eq!(again["ID"], id.as_str());

        let response = warp::test::request()
            .method("GET")
            .path("/patients")
            .reply(&routes)
            .await;
        let patients: Vec<String> = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(patients.len(), 1);

        let response = warp::test::request()
            .method("GET")
            .path(&format!("/instances/{}/file", id))
            .reply(&routes)
            .await;
        assert_eq!(response.status(), 200);
        assert_eq!(response.body().to_vec(), buffer);
    }

    #[tokio::test]
    async fn errors_are_described_as_json() {
        let (_dir, context) = test_context(serde_json::json!({}));
        let routes = build_routes(context);

        let response = warp::test::request()
            .method("GET")
            .path("/instances/ffffffff-ffffffff-ffffffff-ffffffff-ffffffff")
            .reply(&routes)
            .await;
        assert_eq!(response.status(), 404);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["HttpStatus"], 404);
        assert_eq!(body["ServerError"], "UnknownResource");
        assert_eq!(body["Method"], "GET");
    }

    #[tokio::test]
    async fn describe_errors_can_be_disabled() {
        let (_dir, context) = test_context(serde_json::json!({
            "HttpDescribeErrors": false
        }));
        let routes = build_routes(context);

        let response = warp::test::request()
            .method("GET")
            .path("/instances/ffffffff-ffffffff-ffffffff-ffffffff-ffffffff")
            .reply(&routes)
            .await;
        assert_eq!(response.status(), 404);
        assert!(response.body().is_empty());
    }

    #[tokio::test]
    async fn lua_http_filter_rejects_with_403() {
        let (_dir, context) = test_context(serde_json::json!({}));
        context
            .lua
            .lock()
            .execute(
                "function IncomingHttpRequestFilter(method, uri, ip, user)
                   return uri ~= '/secret'
                 end",
            )
            .unwrap();
        let routes = build_routes(context);

        let response = warp::test::request()
            .method("GET")
            .path("/system")
            .reply(&routes)
            .await;
        assert_eq!(response.status(), 200);

        let response = warp::test::request()
            .method("GET")
            .path("/secret")
            .reply(&routes)
            .await;
        assert_eq!(response.status(), 403);
    }

    #[tokio::test]
    async fn authentication_is_enforced_when_enabled() {
        let (_dir, context) = test_context(serde_json::json!({
            "AuthenticationEnabled": true,
            "RegisteredUsers": {"alice": "secret"}
        }));
        let routes = build_routes(context);

        let response = warp::test::request()
            .method("GET")
            .path("/system")
            .reply(&routes)
            .await;
        assert_eq!(response.status(), 401);

        let credentials =
            base64::engine::general_purpose::STANDARD.encode("alice:secret");
        let response = warp::test::request()
            .method("GET")
            .path("/system")
            .header("authorization", format!("Basic {}", credentials))
            .reply(&routes)
            .await;
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn plugin_routes_are_reachable() {
        let (_dir, context) = test_context(serde_json::json!({}));
        context
            .plugins
            .register_rest_callback(
                "/sample/(.*)",
                false,
                Box::new(|request| {
                    Ok(RestResponse {
                        status: 200,
                        content_type: "text/plain".to_string(),
                        body: request.groups[0].as_bytes().to_vec(),
                    })
                }),
            )
            .unwrap();
        let routes = build_routes(context);

        let response = warp::test::request()
            .method("GET")
            .path("/sample/hello")
            .reply(&routes)
            .await;
        assert_eq!(response.status(), 200);
        assert_eq!(response.body().to_vec(), b"hello".to_vec());

        let response = warp::test::request()
            .method("GET")
            .path("/nowhere")
            .reply(&routes)
            .await;
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn protection_round_trip() {
        let (_dir, context) = test_context(serde_json::json!({}));
        let routes = build_routes(context.clone());

        let response = warp::test::request()
            .method("POST")
            .path("/instances")
            .body(synthesize_dicom("P1", "1.2.3", "1.2.3.4", "1.2.3.4.5"))
            .reply(&routes)
            .await;
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        let patient = body["ParentPatient"].as_str().unwrap().to_string();

        let response = warp::test::request()
            .method("PUT")
            .path(&format!("/patients/{}/protected", patient))
            .body("1")
            .reply(&routes)
            .await;
        assert_eq!(response.status(), 200);

        let response = warp::test::request()
            .method("GET")
            .path(&format!("/patients/{}/protected", patient))
            .reply(&routes)
            .await;
        assert_eq!(response.body().to_vec(), b"1".to_vec());
    }

    #[tokio::test]
    async fn changes_feed_reports_the_ingestion() {
        let (_dir, context) = test_context(serde_json::json!({}));
        let routes = build_routes(context);

        warp::test::request()
            .method("POST")
            .path("/instances")
            .body(synthesize_dicom("P1", "1.2.3", "1.2.3.4", "1.2.3.4.5"))
            .reply(&routes)
            .await;

        let response = warp::test::request()
            .method("GET")
            .path("/changes?since=0&limit=10")
            .reply(&routes)
            .await;
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["Done"], true);
        let changes = body["Changes"].as_array().unwrap();
        assert_eq!(changes.len(), 4);
        assert_eq!(changes[0]["ChangeType"], "NewPatient");
        assert_eq!(changes[3]["ChangeType"], "NewInstance");
    }
}
