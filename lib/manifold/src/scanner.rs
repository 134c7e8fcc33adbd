//! Bus discovery: sweep the address range, probe for a device type and pull
//! the identification bundle off every responder. A responder that cannot
//! answer part of the bundle is still kept, with defaults filled in, so the
//! operator keeps control over partially broken instruments.

use crate::gate::PortGate;
use crate::instrument::Instrument;
use crate::support::BusResult;
use propar::logging::{self, Logger};
use propar::params::dde;
use propar::value::Value;
use std::sync::Arc;

/// The full PROPAR address sweep.
pub const FULL_SWEEP: std::ops::RangeInclusive<u8> = 1..=127;

#[derive(Debug, Clone, PartialEq)]
pub struct ScannedInstrument {
    pub address: u8,
    pub device_type: String,
    pub model: String,
    pub usertag: String,
    pub fluid: String,
    pub fluid_index: u8,
    pub capacity: f32,
    pub unit: String,
    pub fsetpoint: f32,
    pub ident_nr: i8,
}

/// Probe every address in the range. Addresses that do not answer the device
/// type probe are skipped; everything else comes back as an instrument.
pub fn scan<'a, I, L>(gate: &Arc<PortGate>, addresses: I, log: L) -> BusResult<Vec<ScannedInstrument>>
where
    I: IntoIterator<Item = u8>,
    L: Into<Option<&'a Logger>>,
{
    let log = logging::child(log);
    let mut found = Vec::new();

    for address in addresses {
        let instrument = Instrument::new(gate.clone(), address, &log)?;

        let device_type = match instrument.probe_dde(dde::DEVICE_TYPE) {
            Ok(value) => value.as_str().unwrap_or("Unknown").to_string(),
            Err(err) => {
                logging::trace!(log, "no instrument";
                                "context" => "scan", "address" => address, "error" => ?err);
                continue;
            }
        };

        logging::info!(log, "instrument found";
                       "context" => "scan", "address" => address, "device_type" => &device_type);

        found.push(identify(&instrument, address, device_type, &log));
    }

    Ok(found)
}

/// Read the identification bundle, substituting defaults for anything the
/// instrument will not answer.
fn identify(
    instrument: &Instrument,
    address: u8,
    device_type: String,
    log: &Logger,
) -> ScannedInstrument {
    let string_or = |number: u16, fallback: String| match instrument.probe_dde(number) {
        Ok(value) => value
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| fallback.clone()),
        Err(err) => {
            logging::debug!(log, "bundle parameter missing, using default";
                            "context" => "identify", "address" => address,
                            "dde" => number, "error" => ?err);
            fallback
        }
    };

    let float_or = |number: u16, fallback: f32| {
        instrument
            .probe_dde(number)
            .ok()
            .and_then(|value| value.as_f32())
            .unwrap_or(fallback)
    };

    let byte_or = |number: u16, fallback: i8| {
        instrument
            .probe_dde(number)
            .ok()
            .and_then(|value| value.as_i8())
            .unwrap_or(fallback)
    };

    ScannedInstrument {
        address,
        device_type,
        model: string_or(dde::MODEL_NUMBER, format!("Unknown_Model_Addr{}", address)),
        usertag: string_or(dde::USER_TAG, format!("Instrument_{}", address)),
        fluid: string_or(dde::FLUID_NAME, "Unknown".to_string()),
        fluid_index: byte_or(dde::FLUID_INDEX, 0) as u8,
        capacity: float_or(dde::CAPACITY, 100.0),
        unit: string_or(dde::CAPACITY_UNIT, "ml/min".to_string()),
        fsetpoint: float_or(dde::FSETPOINT, 0.0),
        ident_nr: byte_or(dde::IDENT_NUMBER, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimingSettings;
    use crate::testlink::SimBus;

    fn gate_on(bus: &SimBus) -> Arc<PortGate> {
        Arc::new(PortGate::new(
            "sim",
            bus.factory(),
            TimingSettings {
                response_timeout_ms: 25,
                retry_backoff_ms: vec![5, 10, 15],
            },
            None,
        ))
    }

    #[test]
    fn test_scan_finds_responders() {
        let bus = SimBus::new();
        bus.add_instrument(3);
        bus.add_instrument(9);

        let found = scan(&gate_on(&bus), 1..=10, None).unwrap();

        assert_eq!(found.len(), 2);
        assert_eq!(found[0].address, 3);
        assert_eq!(found[1].address, 9);

        assert_eq!(found[0].device_type, "MFC");
        assert_eq!(found[0].model, "F-201CV");
        assert_eq!(found[0].usertag, "Tag3");
        assert_eq!(found[0].fluid, "AiR");
        assert_eq!(found[0].capacity, 100.0);
        assert_eq!(found[0].unit, "ln/min");
        assert_eq!(found[0].fsetpoint, 50.0);
        assert_eq!(found[0].ident_nr, 3);
    }

    #[test]
    fn test_scan_substitutes_defaults() {
        let bus = SimBus::new();
        bus.add_bare_instrument(7);

        let found = scan(&gate_on(&bus), 1..=8, None).unwrap();

        assert_eq!(found.len(), 1);

        let instrument = &found[0];
        assert_eq!(instrument.address, 7);
        assert_eq!(instrument.device_type, "MFC");
        assert_eq!(instrument.model, "Unknown_Model_Addr7");
        assert_eq!(instrument.usertag, "Instrument_7");
        assert_eq!(instrument.fluid, "Unknown");
        assert_eq!(instrument.capacity, 100.0);
        assert_eq!(instrument.unit, "ml/min");
        assert_eq!(instrument.fsetpoint, 0.0);
        assert_eq!(instrument.ident_nr, 0);
    }

    #[test]
    fn test_scan_empty_bus() {
        let bus = SimBus::new();

        let found = scan(&gate_on(&bus), 1..=5, None).unwrap();

        assert!(found.is_empty());
    }
}
