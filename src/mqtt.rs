use anyhow::{anyhow, Result};
use chrono_tz::Tz;
use log::{error, info, warn};
use rumqttc::{Client, Connection, Event, MqttOptions, Outgoing, Packet, QoS};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::thread;
use std::time::Duration;

use crate::config::RecordArgs;
use crate::normalize::Normalizer;
use crate::payload;
use crate::reading::{Reading, Source};
use crate::tsv::TsvAppender;

/// Which source a topic delivers.
#[derive(Debug, Clone)]
pub struct Route {
    pub topic: String,
    pub source: Source,
}

pub fn routes(args: &RecordArgs) -> Vec<Route> {
    vec![
        Route {
            topic: args.meter_topic.clone(),
            source: Source::Meter,
        },
        Route {
            topic: args.pv_topic.clone(),
            source: Source::Pv,
        },
    ]
}

/// A broker session without stored state has no subscriptions, so every
/// such ConnAck (first connect and each reconnect) needs them issued again.
fn needs_subscribe(event: &Event) -> bool {
    matches!(event, Event::Incoming(Packet::ConnAck(ack)) if !ack.session_present)
}

fn subscribe_all(client: &Client, routes: &[Route]) {
    for route in routes {
        match client.try_subscribe(route.topic.as_str(), QoS::AtMostOnce) {
            Ok(()) => info!("Subscribed to {} ({})", route.topic, route.source),
            Err(e) => error!("Failed to subscribe to {}: {}", route.topic, e),
        }
    }
}

/// Decode and normalize one message. `None` for topics without a route.
fn to_reading(
    routes: &[Route],
    normalizers: &[(Source, Normalizer)],
    topic: &str,
    payload: &[u8],
) -> Option<Result<(Source, Reading)>> {
    let route = routes.iter().find(|r| r.topic == topic)?;
    let normalizer = normalizers
        .iter()
        .find(|(source, _)| *source == route.source)
        .map(|(_, n)| n)?;

    Some(payload::decode(route.source, payload).and_then(|raw| {
        normalizer
            .normalize_one(&raw)
            .map(|reading| (route.source, reading))
            .map_err(|e| anyhow!("Malformed {} reading on {}: {}", route.source, topic, e))
    }))
}

/// Drive the broker connection and push normalized readings into the queue.
/// Subscriptions are (re)issued on every fresh session.
/// Returns when the queue is closed or the client disconnected.
fn produce(
    client: Client,
    mut connection: Connection,
    routes: Vec<Route>,
    tz: Tz,
    tx: SyncSender<(Source, Reading)>,
) {
    let normalizers = [
        (Source::Meter, Normalizer::new(Source::Meter, tz)),
        (Source::Pv, Normalizer::new(Source::Pv, tz)),
    ];
    let mut malformed = 0usize;

    for event in connection.iter() {
        if event.as_ref().is_ok_and(needs_subscribe) {
            subscribe_all(&client, &routes);
        }
        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                match to_reading(&routes, &normalizers, &publish.topic, &publish.payload) {
                    Some(Ok(item)) => {
                        if tx.send(item).is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        malformed += 1;
                        warn!("{:#} ({} dropped so far)", e, malformed);
                    }
                    None => warn!("Ignoring message on unrouted topic {}", publish.topic),
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => continue,
            Err(e) => {
                error!("MQTT connection error: {}; retrying", e);
                thread::sleep(Duration::from_secs(2));
            }
        }
    }
    info!("Broker event loop stopped");
}

/// Subscribe to all routes and append every reading to its source's file.
///
/// The connection is owned here: opened on start, disconnected when done.
/// Network I/O runs on its own thread; a bounded queue hands readings to
/// the writer on this thread.
pub fn record(args: &RecordArgs, tz: Tz) -> Result<()> {
    let routes = routes(args);

    let mut opts = MqttOptions::new(&args.mqtt_client_id, &args.mqtt_host, args.mqtt_port);
    opts.set_keep_alive(Duration::from_secs(60));
    if let (Some(user), Some(password)) = (&args.mqtt_username, &args.mqtt_password) {
        opts.set_credentials(user, password);
    }

    let (client, connection) = Client::new(opts, 10);

    let mut meter = TsvAppender::open(&args.meter_file, Source::Meter)?;
    let mut pv = TsvAppender::open(&args.pv_file, Source::Pv)?;

    let (tx, rx) = sync_channel(args.queue_capacity.max(1));
    let subscriber = client.clone();
    let producer = thread::spawn(move || produce(subscriber, connection, routes, tz, tx));

    let mut written = 0usize;
    for (source, reading) in rx.iter() {
        let appender = match source {
            Source::Meter => &mut meter,
            Source::Pv => &mut pv,
        };
        if let Err(e) = appender.append(&reading) {
            error!("Failed to write {} reading: {:#}", source, e);
            continue;
        }
        written += 1;
        if args.max_readings.is_some_and(|max| written >= max) {
            info!("Wrote {} reading(s), stopping", written);
            break;
        }
    }

    drop(rx);
    client.disconnect().ok();
    producer
        .join()
        .map_err(|_| anyhow!("Broker thread panicked"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Europe::Berlin;
    use clap::Parser;
    use rumqttc::{ConnAck, ConnectReturnCode};

    fn args() -> RecordArgs {
        let config = crate::config::Config::parse_from(["pvsavings", "record"]);
        match config.command {
            crate::config::Command::Record(args) => args,
            _ => unreachable!(),
        }
    }

    fn normalizers() -> [(Source, Normalizer); 2] {
        [
            (Source::Meter, Normalizer::new(Source::Meter, Berlin)),
            (Source::Pv, Normalizer::new(Source::Pv, Berlin)),
        ]
    }

    #[test]
    fn default_routes() {
        let routes = routes(&args());
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].source, Source::Meter);
        assert_eq!(routes[1].topic, "Plug3/status/switch:0");
        assert_eq!(routes[1].source, Source::Pv);
    }

    fn connack(session_present: bool) -> Event {
        Event::Incoming(Packet::ConnAck(ConnAck {
            session_present,
            code: ConnectReturnCode::Success,
        }))
    }

    #[test]
    fn subscribe_on_every_fresh_session() {
        assert!(needs_subscribe(&connack(false)));
        // reconnect after a broker restart comes back clean as well
        let events = [connack(false), Event::Incoming(Packet::PingResp), connack(false)];
        assert_eq!(events.iter().filter(|e| needs_subscribe(e)).count(), 2);
    }

    #[test]
    fn no_subscribe_for_resumed_session_or_other_events() {
        assert!(!needs_subscribe(&connack(true)));
        assert!(!needs_subscribe(&Event::Incoming(Packet::PingResp)));
        assert!(!needs_subscribe(&Event::Outgoing(Outgoing::PingReq)));
    }

    #[test]
    fn meter_message_normalized() {
        let routes = routes(&args());
        let payload = br#"{"Time":"2024-03-16T06:44:08","MT681":{"Total_in":16.4396,"Power_cur":80,"Total_out":14.6403}}"#;
        let (source, reading) =
            to_reading(&routes, &normalizers(), "tele/tasmota_MT681/SENSOR", payload)
                .unwrap()
                .unwrap();
        assert_eq!(source, Source::Meter);
        assert_eq!(reading.direct_power, Some(80.0));
        assert_eq!(
            reading.timestamp.naive_local().to_string(),
            "2024-03-16 06:44:08"
        );
    }

    #[test]
    fn unrouted_topic_ignored() {
        let routes = routes(&args());
        assert!(to_reading(&routes, &normalizers(), "Plug9/status/switch:0", b"{}").is_none());
    }

    #[test]
    fn malformed_message_reported() {
        let routes = routes(&args());
        let payload = br#"{"Time":"soon","MT681":{"Total_in":1.0,"Total_out":1.0}}"#;
        let result = to_reading(&routes, &normalizers(), "tele/tasmota_MT681/SENSOR", payload);
        assert!(result.unwrap().is_err());
    }
}
