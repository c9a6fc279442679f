//! Process wiring: spawn the component tasks and run the client server
//! until shutdown.

use tokio_util::sync::CancellationToken;

use crate::{
    Error,
    broker::Broker,
    config::Config,
    coordinator::Coordinator,
    digipeater::DigipeaterHandle,
    server,
    source::{
        is::AprsIsClient,
        kiss::RfInterface,
        udp,
    },
};

pub async fn run(config: Config, shutdown: CancellationToken) -> Result<(), Error> {
    tracing::info!(callsign = %config.callsign, "starting gateway");

    let broker = Broker::spawn(
        config.server.clone(),
        config.acl.clone(),
        config.history.clone(),
        shutdown.clone(),
    );

    let (channels, source_receiver, digipeat_receiver) = Coordinator::channels();

    let digipeater = DigipeaterHandle::spawn(
        config.digipeater.clone(),
        config.digipeater_callsign(),
        channels.digipeat_sender.clone(),
        shutdown.clone(),
    );

    let is_client = config.aprs_is.clone().map(|is_config| {
        let callsign = is_config
            .callsign
            .clone()
            .unwrap_or_else(|| config.callsign.clone());
        AprsIsClient::spawn(is_config, callsign, channels.sink.clone(), shutdown.clone())
    });

    let rf_interfaces: Vec<RfInterface> = config
        .rf
        .iter()
        .enumerate()
        .map(|(index, rf_config)| {
            RfInterface::spawn(rf_config.clone(), index, channels.sink.clone(), shutdown.clone())
        })
        .collect();

    if let Some(udp_config) = config.udp.clone() {
        udp::spawn(udp_config, channels.sink.clone(), shutdown.clone());
    }

    let _coordinator = Coordinator::spawn(
        config.clone(),
        broker.clone(),
        digipeater,
        is_client,
        rf_interfaces,
        source_receiver,
        digipeat_receiver,
        shutdown.clone(),
    );

    server::run(
        config.server.clone(),
        config.callsign.clone(),
        broker,
        channels.sink,
        shutdown,
    )
    .await?;

    Ok(())
}
