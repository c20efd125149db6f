use super::{check_agent_qs, Mixer, MixerInput};
use crate::agent::ImagineGroups;
use crate::Result;
use tch::{Kind, Tensor};

/// Parameter-free sum of agent Qs
#[derive(Debug, Clone)]
pub struct VdnMixer {
    n_agents: i64,
}

impl VdnMixer {
    pub fn new(n_agents: i64) -> Self {
        Self { n_agents }
    }
}

impl Mixer for VdnMixer {
    fn mix(&self, agent_qs: &Tensor, _inputs: &MixerInput) -> Result<Tensor> {
        check_agent_qs(agent_qs, self.n_agents)?;
        Ok(agent_qs.sum_dim_intlist([2i64].as_slice(), true, Kind::Float))
    }

    fn mix_imagined(
        &self,
        agent_qs: &Tensor,
        _inputs: &MixerInput,
        _groups: &ImagineGroups,
        want_prop: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        check_agent_qs(agent_qs, 2 * self.n_agents)?;
        let q_tot = agent_qs.sum_dim_intlist([2i64].as_slice(), true, Kind::Float);
        // every agent Q carries unit weight, so each half holds half the mass
        let prop = want_prop.then(|| Tensor::from(0.5f32).to_device(agent_qs.device()));
        Ok((q_tot, prop))
    }
}
