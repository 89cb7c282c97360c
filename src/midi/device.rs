use std::time::Instant;

use midir::{Ignore, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use ringbuf::traits::{Producer, Split};
use ringbuf::{HeapCons, HeapRb};

use crate::config::PortConfig;
use crate::error::{Error, Result};
use crate::events::{DeviceMessage, MidiMessage};

const CLIENT_NAME: &str = "accompanist";

/// Messages from one connected input port.
pub struct InputSource {
    pub name: String,
    /// Clock sources feed tempo and transport only.
    pub clock: bool,
    pub consumer: HeapCons<DeviceMessage>,
}

/// Open input connections. Dropping this closes the ports.
pub struct InputPorts {
    _connections: Vec<MidiInputConnection<()>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortListing {
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

pub fn list_ports() -> Result<PortListing> {
    let midi_in = MidiInput::new(CLIENT_NAME).map_err(device_error)?;
    let midi_out = MidiOutput::new(CLIENT_NAME).map_err(device_error)?;
    Ok(PortListing {
        inputs: midi_in
            .ports()
            .iter()
            .filter_map(|p| midi_in.port_name(p).ok())
            .collect(),
        outputs: midi_out
            .ports()
            .iter()
            .filter_map(|p| midi_out.port_name(p).ok())
            .collect(),
    })
}

/// Picks the input ports to open, paired with whether each one is the
/// clock source.
pub fn select_inputs(names: &[String], ports: &PortConfig) -> Vec<(String, bool)> {
    names
        .iter()
        .filter_map(|name| {
            if ports.clock.as_deref() == Some(name.as_str()) {
                return Some((name.clone(), true));
            }
            if ports.output.as_deref() == Some(name.as_str()) {
                return None;
            }
            match &ports.input_filter {
                Some(filter) if !name.contains(filter.as_str()) => None,
                _ => Some((name.clone(), false)),
            }
        })
        .collect()
}

/// Opens every selected input port on its own client. Each port callback
/// parses messages and pushes them onto a ring the I/O loop drains.
pub fn connect_inputs(ports: &PortConfig, capacity: usize) -> Result<(InputPorts, Vec<InputSource>)> {
    let names = list_ports()?.inputs;
    let selected = select_inputs(&names, ports);
    if !selected.iter().any(|(_, clock)| !clock) {
        return Err(Error::Device(format!(
            "no MIDI input matches {:?} (available: {names:?})",
            ports.input_filter
        )));
    }

    let mut connections = Vec::with_capacity(selected.len());
    let mut sources = Vec::with_capacity(selected.len());
    for (name, clock) in selected {
        let mut midi_in = MidiInput::new(CLIENT_NAME).map_err(device_error)?;
        midi_in.ignore(Ignore::SysexAndActiveSense);
        let Some(port) = midi_in
            .ports()
            .into_iter()
            .find(|p| midi_in.port_name(p).map(|n| n == name).unwrap_or(false))
        else {
            tracing::warn!(port = %name, "input port disappeared before connecting");
            continue;
        };

        let (mut producer, consumer) = HeapRb::<DeviceMessage>::new(capacity).split();
        let connection = midi_in
            .connect(
                &port,
                "accompanist-input",
                move |_timestamp, bytes, _| {
                    if let Some(message) = MidiMessage::parse(bytes) {
                        let _ = producer.try_push(DeviceMessage {
                            at: Instant::now(),
                            message,
                        });
                    }
                },
                (),
            )
            .map_err(device_error)?;

        tracing::info!(port = %name, clock, "connected MIDI input");
        connections.push(connection);
        sources.push(InputSource {
            name,
            clock,
            consumer,
        });
    }

    Ok((
        InputPorts {
            _connections: connections,
        },
        sources,
    ))
}

/// Connects the named output port, or the first one available.
pub fn connect_output(name: Option<&str>) -> Result<MidiOutputConnection> {
    let midi_out = MidiOutput::new(CLIENT_NAME).map_err(device_error)?;
    let ports = midi_out.ports();
    let port = match name {
        Some(name) => ports
            .iter()
            .find(|p| midi_out.port_name(p).map(|n| n == name).unwrap_or(false)),
        None => ports.first(),
    }
    .ok_or_else(|| Error::Device(format!("no MIDI output port {}", name.unwrap_or("available"))))?;

    let port_name = midi_out.port_name(port).unwrap_or_default();
    let connection = midi_out
        .connect(port, "accompanist-output")
        .map_err(device_error)?;
    tracing::info!(port = %port_name, "connected MIDI output");
    Ok(connection)
}

fn device_error(e: impl std::fmt::Display) -> Error {
    Error::Device(e.to_string())
}
