use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::error::RegistryError;
use crate::models::{AxisId, MotorInfo};

/// Validated set of motors, in registration order.
#[derive(Debug, Clone, Default)]
pub struct MotorRegistry {
    ports: BTreeSet<String>,
    motors: Vec<Arc<MotorInfo>>,
    index: HashMap<AxisId, usize>,
}

impl MotorRegistry {
    pub fn new<I, S>(ports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MotorRegistry {
            ports: ports.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_motors<I, S>(ports: I, motors: Vec<MotorInfo>) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut registry = Self::new(ports);
        for motor in motors {
            registry.insert(motor)?;
        }
        Ok(registry)
    }

    pub fn insert(&mut self, motor: MotorInfo) -> Result<Arc<MotorInfo>, RegistryError> {
        self.validate(&motor)?;
        let motor = Arc::new(motor);
        self.index.insert(motor.id.clone(), self.motors.len());
        self.motors.push(motor.clone());
        Ok(motor)
    }

    pub fn remove(&mut self, id: &AxisId) -> Result<Arc<MotorInfo>, RegistryError> {
        let position = self
            .index
            .remove(id)
            .ok_or_else(|| RegistryError::UnknownAxis(id.clone()))?;
        let motor = self.motors.remove(position);
        for index in self.index.values_mut() {
            if *index > position {
                *index -= 1;
            }
        }
        Ok(motor)
    }

    pub fn get(&self, id: &AxisId) -> Option<&Arc<MotorInfo>> {
        self.index.get(id).map(|&index| &self.motors[index])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<MotorInfo>> {
        self.motors.iter()
    }

    pub fn on_port<'a>(&'a self, port: &'a str) -> impl Iterator<Item = &'a Arc<MotorInfo>> {
        self.motors.iter().filter(move |motor| motor.port == port)
    }

    pub fn ports(&self) -> impl Iterator<Item = &str> {
        self.ports.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.motors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.motors.is_empty()
    }

    fn validate(&self, motor: &MotorInfo) -> Result<(), RegistryError> {
        let invalid = |field| RegistryError::InvalidParameter {
            axis: motor.id.clone(),
            field,
        };

        if self.index.contains_key(&motor.id) {
            return Err(RegistryError::DuplicateAxis(motor.id.clone()));
        }
        if !self.ports.contains(&motor.port) {
            return Err(RegistryError::UnknownPort {
                axis: motor.id.clone(),
                port: motor.port.clone(),
            });
        }
        if let Some(existing) = self
            .on_port(&motor.port)
            .find(|other| other.device == motor.device)
        {
            return Err(RegistryError::DuplicateDevice {
                port: motor.port.clone(),
                device: motor.device,
                existing: existing.id.clone(),
            });
        }
        if !motor.limits.is_valid() {
            return Err(RegistryError::InvalidLimits(motor.id.clone()));
        }
        if motor.device == 0 {
            return Err(invalid("device address"));
        }
        if !(motor.steps_per_unit.is_finite() && motor.steps_per_unit > 0.0) {
            return Err(invalid("steps per unit"));
        }
        if !motor.limits.contains(motor.home_position) {
            return Err(invalid("home position"));
        }
        if motor.poll_interval.is_zero() {
            return Err(invalid("poll interval"));
        }
        if !(motor.speed.is_finite() && motor.speed > 0.0) {
            return Err(invalid("speed"));
        }
        if motor.max_speed.is_some_and(|max| !(max.is_finite() && max >= motor.speed)) {
            return Err(invalid("max speed"));
        }
        Ok(())
    }
}
