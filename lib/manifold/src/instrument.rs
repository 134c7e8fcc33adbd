//! Address-scoped view of one instrument on a port. The facade owns no
//! connection state; it stamps its address onto descriptors and delegates
//! everything to the port gate.

use crate::driver::Request;
use crate::gate::PortGate;
use crate::support::{BusError, BusResult};
use propar::logging::{self, Logger};
use propar::message::{Command, Parameter, ParameterValue, Response};
use propar::params;
use propar::value::{ParameterType, Value};
use propar::{MAX_ADDRESS, MIN_ADDRESS};
use std::sync::Arc;

pub struct Instrument {
    gate: Arc<PortGate>,
    address: u8,
    channel: u8,
    log: Logger,
}

impl Instrument {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        gate: Arc<PortGate>,
        address: u8,
        log: L,
    ) -> BusResult<Instrument> {
        Self::with_channel(gate, address, 1, log)
    }

    pub fn with_channel<'a, L: Into<Option<&'a Logger>>>(
        gate: Arc<PortGate>,
        address: u8,
        channel: u8,
        log: L,
    ) -> BusResult<Instrument> {
        if address < MIN_ADDRESS || address > MAX_ADDRESS {
            return Err(BusError::InvalidAddress(address));
        }

        Ok(Instrument {
            gate,
            address,
            channel,
            log: logging::child(log),
        })
    }

    #[inline]
    pub fn address(&self) -> u8 {
        self.address
    }

    #[inline]
    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Read a single parameter.
    pub fn read(&self, proc_nr: u8, parm_nr: u8, parm_type: ParameterType) -> BusResult<Value> {
        let param = Parameter::new(proc_nr, parm_nr, parm_type).for_node(self.address);

        let mut values = self.read_parameters(&[param])?;
        Ok(values.remove(0).value)
    }

    /// Write a single parameter and wait for the acknowledgement.
    pub fn write(
        &self,
        proc_nr: u8,
        parm_nr: u8,
        parm_type: ParameterType,
        value: Value,
    ) -> BusResult<()> {
        let param = Parameter::new(proc_nr, parm_nr, parm_type);

        self.write_parameters(&[ParameterValue { param, value }])
    }

    /// Read several parameters in one chained request. The caller's
    /// descriptors are left untouched; copies get this instrument's address
    /// stamped in.
    pub fn read_parameters(&self, params: &[Parameter]) -> BusResult<Vec<ParameterValue>> {
        let stamped: Vec<Parameter> = params.iter().map(|p| p.for_node(self.address)).collect();

        logging::trace!(self.log, "chained read";
                        "context" => "read_parameters",
                        "address" => self.address,
                        "count" => stamped.len());

        match self.gate.transact(Request::Read(stamped))? {
            Response::Values(values) => Ok(values),
            Response::Status { status, .. } => Err(BusError::Status(status)),
        }
    }

    /// Write several parameters in one chained request, acknowledged.
    pub fn write_parameters(&self, params: &[ParameterValue]) -> BusResult<()> {
        let stamped: Vec<ParameterValue> = params
            .iter()
            .map(|pv| ParameterValue {
                param: pv.param.for_node(self.address),
                value: pv.value.clone(),
            })
            .collect();

        logging::trace!(self.log, "chained write";
                        "context" => "write_parameters",
                        "address" => self.address,
                        "count" => stamped.len());

        match self
            .gate
            .transact(Request::Write(Command::SendParmWithAck, stamped))?
        {
            Response::Status { status, .. } if status.is_ok() => Ok(()),
            Response::Status { status, .. } => Err(BusError::Status(status)),
            Response::Values(_) => Err(propar::support::ProtocolError::MalformedMessage.into()),
        }
    }

    /// Read a parameter by DDE number.
    pub fn read_dde(&self, dde: u16) -> BusResult<Value> {
        let info = params::lookup(dde).ok_or(BusError::UnknownParameter(dde))?;

        self.read(info.proc_nr, info.parm_nr, info.parm_type)
    }

    /// Write a parameter by DDE number. The value must carry the database
    /// type for the parameter.
    pub fn write_dde(&self, dde: u16, value: Value) -> BusResult<()> {
        let info = params::lookup(dde).ok_or(BusError::UnknownParameter(dde))?;

        if value.parameter_type() != info.parm_type {
            return Err(propar::support::ProtocolError::UnknownType.into());
        }

        self.write(info.proc_nr, info.parm_nr, info.parm_type, value)
    }

    /// Single-attempt read of a DDE, for discovery sweeps.
    pub(crate) fn probe_dde(&self, dde: u16) -> BusResult<Value> {
        let info = params::lookup(dde).ok_or(BusError::UnknownParameter(dde))?;
        let param = info.parameter().for_node(self.address);

        match self.gate.probe(Request::Read(vec![param]))? {
            Response::Values(mut values) => Ok(values.remove(0).value),
            Response::Status { status, .. } => Err(BusError::Status(status)),
        }
    }
}
