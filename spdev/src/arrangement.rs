//! Named contacts on DAC outputs, driven by virtual voltages.
//!
//! Neighbouring contacts couple into each other. The voltage applied to each
//! output is the correction matrix times the vector of virtual voltages, so a
//! virtual voltage can move one contact while the others are compensated.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::anyhow;
use ndarray::{Array1, Array2, ArrayView1};

use spdev_protocol::dac::{Repetitions, VOLTAGE_LIMIT};
use spdev_protocol::scpi::round_significant;

use crate::spdac::{DcList, DacOutput, SpDac};
use crate::Error;

pub struct Arrangement {
    names: Vec<String>,
    outputs: Vec<DacOutput>,
    correction: Array2<f64>,
    virtual_voltages: Array1<f64>,
}

impl Arrangement {
    /// `contacts` maps contact names to output channels. The order given here
    /// is the row and column order of the correction matrix.
    pub fn new(dac: &SpDac, contacts: &[(&str, u8)]) -> crate::Result<Self> {
        let mut names = Vec::with_capacity(contacts.len());
        let mut outputs = Vec::with_capacity(contacts.len());
        let mut channels = HashSet::new();
        for (name, channel) in contacts {
            if names.iter().any(|x: &String| x == name) {
                return Err(Error::argument(anyhow!("Contact {} given twice", name)));
            }
            if !channels.insert(*channel) {
                return Err(Error::argument(anyhow!("Output {} assigned to two contacts", channel)));
            }
            outputs.push(dac.output(*channel)?.clone());
            names.push(name.to_string());
        }
        let n = names.len();
        Ok(Self {
            names,
            outputs,
            correction: Array2::eye(n),
            virtual_voltages: Array1::zeros(n),
        })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// In the same order as [`Arrangement::channel_numbers`].
    pub fn contact_names(&self) -> &[String] {
        &self.names
    }

    pub fn channel_numbers(&self) -> Vec<u8> {
        self.outputs.iter().map(|x| x.channel()).collect()
    }

    pub fn correction_matrix(&self) -> &Array2<f64> {
        &self.correction
    }

    pub fn output(&self, contact: &str) -> crate::Result<&DacOutput> {
        Ok(&self.outputs[self.index(contact)?])
    }

    fn index(&self, contact: &str) -> crate::Result<usize> {
        self.names
            .iter()
            .position(|x| x == contact)
            .ok_or_else(|| Error::argument(anyhow!("No contact named {:?}", contact)))
    }

    fn factors<'a>(&self, factors: &'a [f64]) -> crate::Result<ArrayView1<'a, f64>> {
        if factors.len() != self.len() {
            return Err(Error::argument(anyhow!(
                "Expected {} correction factors, got {}",
                self.len(),
                factors.len()
            )));
        }
        if let Some(x) = factors.iter().find(|x| !x.is_finite()) {
            return Err(Error::argument(anyhow!("Invalid correction factor {}", x)));
        }
        Ok(ArrayView1::from(factors))
    }

    /// Replace the row of `contact`, i.e. how the virtual voltages of all
    /// contacts act on it.
    pub fn initiate_correction(&mut self, contact: &str, factors: &[f64]) -> crate::Result<()> {
        let index = self.index(contact)?;
        let factors = self.factors(factors)?;
        self.correction.row_mut(index).assign(&factors);
        Ok(())
    }

    /// Multiply the identity with the row of `contact` replaced by `factors`
    /// onto the correction matrix. Corrections between neighbours can be
    /// built up one contact at a time this way.
    pub fn add_correction(&mut self, contact: &str, factors: &[f64]) -> crate::Result<()> {
        let index = self.index(contact)?;
        let factors = self.factors(factors)?;
        let mut multiplier = Array2::<f64>::eye(self.len());
        multiplier.row_mut(index).assign(&factors);
        self.correction = multiplier.dot(&self.correction);
        Ok(())
    }

    pub fn virtual_voltage(&self, contact: &str) -> crate::Result<f64> {
        Ok(self.virtual_voltages[self.index(contact)?])
    }

    fn correct(&self, virtual_voltages: &Array1<f64>) -> Array1<f64> {
        self.correction.dot(virtual_voltages).mapv(round_significant)
    }

    /// Corrected voltages of all contacts.
    pub fn actual_voltages(&self) -> Array1<f64> {
        self.correct(&self.virtual_voltages)
    }

    pub async fn set_virtual_voltage(&mut self, contact: &str, volts: f64) -> crate::Result<()> {
        self.set_virtual_voltages(&[(contact, volts)]).await
    }

    /// Update several virtual voltages and apply the corrected voltages to
    /// all outputs. Nothing changes if a contact is unknown or a corrected
    /// voltage is out of range.
    pub async fn set_virtual_voltages(&mut self, voltages: &[(&str, f64)]) -> crate::Result<()> {
        let mut updated = self.virtual_voltages.clone();
        for (contact, volts) in voltages {
            updated[self.index(contact)?] = *volts;
        }
        let actual = self.correct(&updated);
        self.check_range(actual.iter())?;
        self.virtual_voltages = updated;
        for (output, volts) in self.outputs.iter().zip(actual.iter()) {
            output.dc_constant(*volts).await?;
        }
        Ok(())
    }

    fn check_range<'a, I: Iterator<Item = &'a f64>>(&self, mut volts: I) -> crate::Result<()> {
        match volts.find(|x| !x.is_finite() || x.abs() > VOLTAGE_LIMIT) {
            Some(x) => Err(Error::argument(anyhow!("Corrected voltage {} out of range", x))),
            None => Ok(()),
        }
    }

    /// Corrected voltages while the virtual voltage of `contact` steps
    /// through `voltages`. One row per step, one column per contact.
    pub fn sweep_values(&self, contact: &str, voltages: &[f64]) -> crate::Result<Array2<f64>> {
        let index = self.index(contact)?;
        let steps = voltages.iter().map(|volts| {
            let mut x = self.virtual_voltages.clone();
            x[index] = *volts;
            x
        });
        self.rows(steps)
    }

    /// Corrected voltages while `contacts` move linearly from `start` to
    /// `end` in `steps` points and back again, without repeating the
    /// turning points.
    pub fn detune_values(
        &self,
        contacts: &[&str],
        start: &[f64],
        end: &[f64],
        steps: usize,
    ) -> crate::Result<Array2<f64>> {
        if start.len() != contacts.len() || end.len() != contacts.len() {
            return Err(Error::argument(anyhow!("There must be exactly one voltage per contact")));
        }
        let indices = contacts
            .iter()
            .map(|x| self.index(x))
            .collect::<crate::Result<Vec<_>>>()?;
        let paths = start
            .iter()
            .zip(end.iter())
            .map(|(a, b)| forward_and_back(*a, *b, steps))
            .collect::<crate::Result<Vec<_>>>()?;
        let len = paths.first().map(|x| x.len()).unwrap_or(0);
        let rows = (0..len).map(|step| {
            let mut x = self.virtual_voltages.clone();
            for (index, path) in indices.iter().zip(paths.iter()) {
                x[*index] = path[step];
            }
            x
        });
        self.rows(rows)
    }

    fn rows<I: Iterator<Item = Array1<f64>>>(&self, steps: I) -> crate::Result<Array2<f64>> {
        let mut data = Vec::new();
        let mut count = 0;
        for x in steps {
            data.extend(self.correct(&x).iter().copied());
            count += 1;
        }
        Array2::from_shape_vec((count, self.len()), data).map_err(Error::internal)
    }

    /// Load one column of `values` into the list generator of each output and
    /// start them one after the other.
    pub async fn run_lists(&self, values: &Array2<f64>, dwell: Duration, repetitions: Repetitions) -> crate::Result<()> {
        if values.ncols() != self.len() || values.nrows() == 0 {
            return Err(Error::argument(anyhow!(
                "Expected a non-empty table with {} columns",
                self.len()
            )));
        }
        self.check_range(values.iter())?;
        for (idx, output) in self.outputs.iter().enumerate() {
            let mut list = DcList::new(values.column(idx).to_vec());
            list.dwell = dwell;
            list.repetitions = repetitions;
            output.dc_list(&list).await?;
        }
        log::debug!("Starting {} lists of {} points", self.len(), values.nrows());
        for output in &self.outputs {
            output.dc_start().await?;
        }
        Ok(())
    }

    /// Sweep the virtual voltage of `contact` on the list generators.
    pub async fn virtual_sweep(
        &self,
        contact: &str,
        voltages: &[f64],
        dwell: Duration,
        repetitions: Repetitions,
    ) -> crate::Result<Array2<f64>> {
        let values = self.sweep_values(contact, voltages)?;
        self.run_lists(&values, dwell, repetitions).await?;
        Ok(values)
    }

    pub async fn abort(&self) -> crate::Result<()> {
        for output in &self.outputs {
            output.dc_abort().await?;
        }
        Ok(())
    }
}

/// `steps` points from `start` to `end`, followed by the way back without
/// both end points.
pub fn forward_and_back(start: f64, end: f64, steps: usize) -> crate::Result<Vec<f64>> {
    let forward = crate::spdac::linear_steps(start, end, steps)?;
    let back = forward.iter().rev().skip(1).take(steps.saturating_sub(2)).copied();
    let mut ret = forward.clone();
    ret.extend(back);
    Ok(ret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{Instrument, SessionOptions};
    use crate::{sim, DeviceOptions, Model};
    use ndarray::array;

    async fn simulated() -> SpDac {
        let instrument = Instrument::new(
            sim::spawn(Model::SpDac),
            "sim::spdac".to_string(),
            SessionOptions {
                timeout: Duration::from_millis(200),
            },
        );
        let options = DeviceOptions {
            reset_delay: Duration::from_millis(1),
            ..Default::default()
        };
        SpDac::connect(instrument, options).await.unwrap()
    }

    async fn arrangement() -> Arrangement {
        let dac = simulated().await;
        Arrangement::new(&dac, &[("gate", 2), ("plunger", 1)]).unwrap()
    }

    #[tokio::test]
    async fn contacts_keep_their_order() {
        let arr = arrangement().await;
        assert_eq!(arr.contact_names(), ["gate".to_string(), "plunger".to_string()]);
        assert_eq!(arr.channel_numbers(), vec![2, 1]);
        assert_eq!(arr.correction_matrix(), &Array2::<f64>::eye(2));
        assert!(matches!(arr.virtual_voltage("barrier"), Err(Error::Argument(_))));
    }

    #[tokio::test]
    async fn reject_duplicate_contacts() {
        let dac = simulated().await;
        assert!(matches!(
            Arrangement::new(&dac, &[("a", 1), ("a", 2)]),
            Err(Error::Argument(_))
        ));
        assert!(matches!(
            Arrangement::new(&dac, &[("a", 1), ("b", 1)]),
            Err(Error::Argument(_))
        ));
        assert!(matches!(Arrangement::new(&dac, &[("a", 3)]), Err(Error::Argument(_))));
    }

    #[tokio::test]
    async fn corrected_voltages_reach_the_outputs() {
        let mut arr = arrangement().await;
        arr.initiate_correction("gate", &[1.0, -0.5]).unwrap();
        arr.set_virtual_voltages(&[("gate", 1.0), ("plunger", 2.0)]).await.unwrap();
        assert_eq!(arr.actual_voltages(), array![0.0, 2.0]);
        assert_eq!(arr.output("gate").unwrap().voltage().await.unwrap(), 0.0);
        assert_eq!(arr.output("plunger").unwrap().voltage().await.unwrap(), 2.0);

        arr.set_virtual_voltage("plunger", 1.0).await.unwrap();
        assert_eq!(arr.virtual_voltage("plunger").unwrap(), 1.0);
        assert_eq!(arr.output("gate").unwrap().voltage().await.unwrap(), 0.5);

        let err = arr.set_virtual_voltage("plunger", 11.0).await.unwrap_err();
        assert!(matches!(err, Error::Argument(_)));
        assert_eq!(arr.virtual_voltage("plunger").unwrap(), 1.0);
    }

    #[tokio::test]
    async fn corrections_compose() {
        let mut arr = arrangement().await;
        arr.add_correction("gate", &[1.0, 0.5]).unwrap();
        arr.add_correction("plunger", &[0.5, 1.0]).unwrap();
        assert_eq!(arr.correction_matrix(), &array![[1.0, 0.5], [0.5, 1.25]]);
        assert!(matches!(arr.add_correction("gate", &[1.0]), Err(Error::Argument(_))));
    }

    #[tokio::test]
    async fn sweep_and_detune_tables() {
        let mut arr = arrangement().await;
        arr.initiate_correction("plunger", &[0.5, 1.0]).unwrap();
        arr.set_virtual_voltage("plunger", 1.0).await.unwrap();
        let values = arr.sweep_values("gate", &[0.0, 1.0, 2.0]).unwrap();
        assert_eq!(values, array![[0.0, 1.0], [1.0, 1.5], [2.0, 2.0]]);
        assert_eq!(arr.virtual_voltage("gate").unwrap(), 0.0);

        let values = arr.detune_values(&["gate"], &[0.0], &[2.0], 3).unwrap();
        assert_eq!(values.column(0).to_vec(), vec![0.0, 1.0, 2.0, 1.0]);
        assert!(arr.detune_values(&["gate"], &[0.0, 1.0], &[2.0], 3).is_err());
        assert_eq!(forward_and_back(0.0, 1.0, 2).unwrap(), vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn virtual_sweep_loads_lists() {
        let arr = arrangement().await;
        let values = arr
            .virtual_sweep("gate", &[0.5, 1.0], Duration::from_millis(1), Repetitions::Count(1))
            .await
            .unwrap();
        assert_eq!(values.nrows(), 2);
        let gate = arr.output("gate").unwrap();
        assert_eq!(gate.dc_list_values().await.unwrap(), vec![0.5, 1.0]);
        assert_eq!(gate.voltage().await.unwrap(), 1.0);
        assert_eq!(arr.output("plunger").unwrap().dc_list_values().await.unwrap(), vec![0.0, 0.0]);
        arr.abort().await.unwrap();
    }
}
