//! Codec mixer controls through the ALSA high-level control interface.

use alsa::ctl::ElemType;
use alsa::hctl::{Elem, HCtl};

use super::error::{HalError, HalResult};
use super::mixer::{Mixer, MixerCtl};

pub struct AlsaMixer {
    hctl: HCtl,
    /// Control names, indexed by `MixerCtl`
    names: Vec<String>,
}

impl AlsaMixer {
    /// Open the control device, e.g. `hw:0`.
    pub fn open(device: &str) -> HalResult<Self> {
        let hctl = HCtl::new(device, false)
            .map_err(|e| HalError::Io(format!("open mixer '{}': {}", device, e)))?;
        hctl.load()
            .map_err(|e| HalError::Io(format!("load mixer '{}': {}", device, e)))?;

        let mut names = Vec::new();
        for elem in hctl.elem_iter() {
            if let Ok(id) = elem.get_id() {
                if let Ok(name) = id.get_name() {
                    names.push(name.to_string());
                }
            }
        }
        log::info!("Mixer {}: {} controls", device, names.len());
        Ok(Self { hctl, names })
    }

    fn elem(&self, ctl: MixerCtl) -> HalResult<Elem<'_>> {
        let name = self
            .names
            .get(ctl.0)
            .ok_or_else(|| HalError::ControlNotFound(format!("#{}", ctl.0)))?;
        self.hctl
            .elem_iter()
            .find(|elem| {
                elem.get_id()
                    .ok()
                    .is_some_and(|id| id.get_name().ok() == Some(name.as_str()))
            })
            .ok_or_else(|| HalError::ControlNotFound(name.clone()))
    }
}

fn write_value(elem: &Elem<'_>, index: usize, value: i32) -> HalResult<()> {
    let io = |e: alsa::Error| HalError::Io(e.to_string());
    let info = elem.info().map_err(io)?;
    let mut current = elem.read().map_err(io)?;
    let idx = index as u32;
    let applied = match info.get_type() {
        ElemType::Boolean => current.set_boolean(idx, value != 0),
        ElemType::Integer => current.set_integer(idx, value),
        ElemType::Enumerated => current.set_enumerated(idx, value.max(0) as u32),
        other => {
            return Err(HalError::InvalidArgument(format!(
                "control type {:?} not writable",
                other
            )));
        }
    };
    if applied.is_none() {
        return Err(HalError::InvalidArgument(format!("value index {}", index)));
    }
    elem.write(&current).map_err(io)?;
    Ok(())
}

impl Mixer for AlsaMixer {
    fn find(&self, name: &str) -> Option<MixerCtl> {
        self.names.iter().position(|n| n == name).map(MixerCtl)
    }

    fn num_values(&self, ctl: MixerCtl) -> usize {
        self.elem(ctl)
            .and_then(|elem| {
                elem.info()
                    .map(|info| info.get_count() as usize)
                    .map_err(|e| HalError::Io(e.to_string()))
            })
            .unwrap_or(0)
    }

    fn set_value(&mut self, ctl: MixerCtl, index: usize, value: i32) -> HalResult<()> {
        let elem = self.elem(ctl)?;
        write_value(&elem, index, value)
    }

    /// Items are addressed as "Off"/"On" or by their numeric index.
    fn set_enum(&mut self, ctl: MixerCtl, item: &str) -> HalResult<()> {
        let value = match item {
            "Off" => 0,
            "On" => 1,
            other => other
                .parse()
                .map_err(|_| HalError::InvalidArgument(format!("enum item '{}'", other)))?,
        };
        let elem = self.elem(ctl)?;
        for index in 0..self.num_values(ctl) {
            write_value(&elem, index, value)?;
        }
        Ok(())
    }
}
