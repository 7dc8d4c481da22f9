//! Route table of the control API

use super::handlers::{self, StreamAction};
use crate::app::BridgeApp;
use std::convert::Infallible;
use std::sync::Arc;
use warp::filters::BoxedFilter;
use warp::reply::Response;
use warp::Filter;

fn with_app(app: Arc<BridgeApp>) -> impl Filter<Extract = (Arc<BridgeApp>,), Error = Infallible> + Clone {
    warp::any().map(move || app.clone())
}

fn status_routes(app: Arc<BridgeApp>) -> BoxedFilter<(Response,)> {
    let overview = warp::path!("status")
        .and(warp::get())
        .and(with_app(app.clone()))
        .and_then(handlers::status);
    let stats = warp::path!("status" / "stats")
        .and(warp::get())
        .and(with_app(app.clone()))
        .and_then(handlers::all_stats);
    let device_stats = warp::path!("status" / "stats" / String)
        .and(warp::get())
        .and(with_app(app.clone()))
        .and_then(handlers::device_stats);
    let mqtt = warp::path!("status" / "mqtt")
        .and(warp::get())
        .and(with_app(app.clone()))
        .and_then(handlers::mqtt_summary);
    let stream = warp::path!("status" / "stream")
        .and(warp::get())
        .and(with_app(app.clone()))
        .and_then(handlers::stream_summary);
    let topics = warp::path!("status" / "topics")
        .and(warp::get())
        .and(with_app(app.clone()))
        .and_then(handlers::topics);
    let device_topics = warp::path!("status" / "topics" / String)
        .and(warp::get())
        .and(with_app(app))
        .and_then(handlers::device_topics);

    overview
        .or(stats)
        .unify()
        .or(device_stats)
        .unify()
        .or(mqtt)
        .unify()
        .or(stream)
        .unify()
        .or(topics)
        .unify()
        .or(device_topics)
        .unify()
        .boxed()
}

fn stream_action(
    name: &'static str,
    action: StreamAction,
    app: Arc<BridgeApp>,
) -> BoxedFilter<(Response,)> {
    warp::path("control")
        .and(warp::path(name))
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::post())
        .and(with_app(app))
        .and_then(move |device_id: String, app: Arc<BridgeApp>| {
            handlers::control_stream(action, device_id, app)
        })
        .boxed()
}

fn control_routes(app: Arc<BridgeApp>) -> BoxedFilter<(Response,)> {
    let clear_queue = warp::path!("control" / "clear-queue" / String)
        .and(warp::post())
        .and(with_app(app.clone()))
        .and_then(handlers::clear_queue);
    let status = warp::path!("control" / "status")
        .and(warp::get())
        .and(with_app(app.clone()))
        .and_then(handlers::control_status);
    let device_status = warp::path!("control" / "status" / String)
        .and(warp::get())
        .and(with_app(app.clone()))
        .and_then(handlers::device_control_status);

    stream_action("pause", StreamAction::Pause, app.clone())
        .or(stream_action("resume", StreamAction::Resume, app.clone()))
        .unify()
        .or(stream_action("stop", StreamAction::Stop, app))
        .unify()
        .or(clear_queue)
        .unify()
        .or(status)
        .unify()
        .or(device_status)
        .unify()
        .boxed()
}

fn command_routes(app: Arc<BridgeApp>) -> BoxedFilter<(Response,)> {
    let single = warp::path!("command")
        .and(warp::post())
        .and(warp::body::bytes())
        .and(with_app(app.clone()))
        .and_then(handlers::send_command);
    let bulk = warp::path!("command" / "bulk")
        .and(warp::post())
        .and(warp::body::bytes())
        .and(with_app(app.clone()))
        .and_then(handlers::send_bulk_command);
    let history = warp::path!("command" / "history" / String)
        .and(warp::get())
        .and_then(handlers::command_history);
    let device = warp::path!("command" / String)
        .and(warp::post())
        .and(warp::body::bytes())
        .and(with_app(app))
        .and_then(handlers::send_device_command);

    single
        .or(bulk)
        .unify()
        .or(history)
        .unify()
        .or(device)
        .unify()
        .boxed()
}

fn device_health_routes(app: Arc<BridgeApp>) -> BoxedFilter<(Response,)> {
    let summary = warp::path!("device-health")
        .and(warp::get())
        .and(with_app(app.clone()))
        .and_then(handlers::health_summary);
    let all = warp::path!("device-health" / "devices" / "all")
        .and(warp::get())
        .and(with_app(app.clone()))
        .and_then(handlers::all_device_health);
    let device = warp::path!("device-health" / String)
        .and(warp::get())
        .and(with_app(app.clone()))
        .and_then(handlers::device_health);
    let retry = warp::path!("device-health" / String / "retry")
        .and(warp::post())
        .and(with_app(app))
        .and_then(handlers::retry_device);

    summary
        .or(all)
        .unify()
        .or(device)
        .unify()
        .or(retry)
        .unify()
        .boxed()
}

/// Every route of the control API, ending in the JSON 404 fallback
pub fn routes(app: Arc<BridgeApp>) -> BoxedFilter<(Response,)> {
    let root = warp::path::end().and(warp::get()).and_then(handlers::root);
    let health = warp::path!("health")
        .and(warp::get())
        .and(with_app(app.clone()))
        .and_then(handlers::health);
    let shutdown = warp::path!("shutdown")
        .and(warp::post())
        .and(with_app(app.clone()))
        .and_then(handlers::shutdown);
    let fallback = warp::any()
        .and(warp::method())
        .and(warp::path::full())
        .and_then(handlers::route_not_found);

    root.or(health)
        .unify()
        .or(status_routes(app.clone()))
        .unify()
        .or(control_routes(app.clone()))
        .unify()
        .or(command_routes(app.clone()))
        .unify()
        .or(device_health_routes(app))
        .unify()
        .or(shutdown)
        .unify()
        .or(fallback)
        .unify()
        .boxed()
}
