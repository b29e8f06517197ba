//! 驱动参数扩展
//!
//! 不同厂商的驱动板会暴露额外的可调参数。与其接受任意键值对，
//! 这里把扩展参数建成按驱动板类型打标的能力：字符串键的参数表在
//! 发送前必须通过该类型的参数 schema 校验——未知键与越界值是前置
//! 条件错误，永远不会上线。
//!
//! 当前闭环步进类型的 schema 覆盖驱动参数块里的可调字段，应用时
//! 走读-改-写：读取参数块、打补丁、整块写回。

use crate::error::DriverError;
use crate::session::MotorSession;
use helix_protocol::{DriveParameters, DriverKind};
use std::collections::BTreeMap;
use tracing::info;

/// 单个参数的约束
#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    /// 参数键
    pub name: &'static str,
    /// 最小值（含）
    pub min: i64,
    /// 最大值（含）
    pub max: i64,
}

/// 按驱动板类型的参数 schema
#[derive(Debug, Clone, Copy)]
pub struct ParamSchema {
    kind: DriverKind,
    specs: &'static [ParamSpec],
}

/// 闭环步进驱动板的可调参数
const CLOSED_LOOP_STEPPER_SPECS: &[ParamSpec] = &[
    ParamSpec { name: "open_loop_ma", min: 0, max: 4000 },
    ParamSpec { name: "closed_loop_max_ma", min: 0, max: 4000 },
    ParamSpec { name: "speed_limit_rpm", min: 0, max: 5000 },
    ParamSpec { name: "stall_threshold_rpm", min: 0, max: 500 },
    ParamSpec { name: "stall_current_ma", min: 0, max: 4000 },
    ParamSpec { name: "stall_timeout_ms", min: 0, max: 60000 },
    ParamSpec { name: "position_error_limit_x10", min: 0, max: 3600 },
];

impl ParamSchema {
    /// 某驱动板类型的 schema
    pub fn for_kind(kind: DriverKind) -> Self {
        match kind {
            DriverKind::ClosedLoopStepper => Self {
                kind,
                specs: CLOSED_LOOP_STEPPER_SPECS,
            },
        }
    }

    /// 驱动板类型
    pub fn kind(&self) -> DriverKind {
        self.kind
    }

    fn spec(&self, name: &str) -> Option<&ParamSpec> {
        self.specs.iter().find(|s| s.name == name)
    }
}

/// 扩展参数表
#[derive(Debug, Clone, Default)]
pub struct ExtensionParams {
    values: BTreeMap<String, i64>,
}

impl ExtensionParams {
    /// 空参数表
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置一个参数
    pub fn set(mut self, name: impl Into<String>, value: i64) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// 按 schema 校验
    ///
    /// 未知键与越界值都是 [`DriverError::InvalidParameter`]。
    pub fn validate(&self, schema: &ParamSchema) -> Result<(), DriverError> {
        for (name, &value) in &self.values {
            let Some(spec) = schema.spec(name) else {
                return Err(DriverError::InvalidParameter {
                    name: name.clone(),
                    reason: format!("unknown parameter for driver kind {:?}", schema.kind()),
                });
            };
            if value < spec.min || value > spec.max {
                return Err(DriverError::InvalidParameter {
                    name: name.clone(),
                    reason: format!("value {value} outside [{}, {}]", spec.min, spec.max),
                });
            }
        }
        Ok(())
    }

    fn patch(&self, params: &mut DriveParameters) {
        for (name, &value) in &self.values {
            match name.as_str() {
                "open_loop_ma" => params.open_loop_ma = value as u16,
                "closed_loop_max_ma" => params.closed_loop_max_ma = value as u16,
                "speed_limit_rpm" => params.speed_limit_rpm = value as u16,
                "stall_threshold_rpm" => params.stall_threshold_rpm = value as u16,
                "stall_current_ma" => params.stall_current_ma = value as u16,
                "stall_timeout_ms" => params.stall_timeout_ms = value as u16,
                "position_error_limit_x10" => params.position_error_limit_x10 = value as u16,
                _ => {}
            }
        }
    }
}

impl MotorSession {
    /// 应用扩展参数（读-改-写）
    ///
    /// 参数表先通过驱动板类型的 schema 校验，任何校验失败都发生在
    /// 线上 I/O 之前。
    pub fn apply_extension_params(
        &mut self,
        params: &ExtensionParams,
        save_to_chip: bool,
    ) -> Result<(), DriverError> {
        let schema = ParamSchema::for_kind(DriverKind::default());
        params.validate(&schema)?;
        if params.is_empty() {
            return Ok(());
        }

        let mut block = self.read_drive_parameters()?;
        params.patch(&mut block);
        self.modify_drive_parameters(block, save_to_chip)?;
        info!(addr = self.addr(), "extension parameters applied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helix_serial::Transport;
    use helix_serial::mock::MockGateway;

    #[test]
    fn test_unknown_key_rejected() {
        let schema = ParamSchema::for_kind(DriverKind::ClosedLoopStepper);
        let params = ExtensionParams::new().set("pid_kp", 100);
        assert!(matches!(
            params.validate(&schema),
            Err(DriverError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_out_of_range_rejected() {
        let schema = ParamSchema::for_kind(DriverKind::ClosedLoopStepper);
        let params = ExtensionParams::new().set("speed_limit_rpm", 99_999);
        assert!(matches!(
            params.validate(&schema),
            Err(DriverError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_valid_params_accepted() {
        let schema = ParamSchema::for_kind(DriverKind::ClosedLoopStepper);
        let params = ExtensionParams::new()
            .set("speed_limit_rpm", 2000)
            .set("stall_timeout_ms", 3000);
        assert!(params.validate(&schema).is_ok());
    }

    #[test]
    fn test_apply_patches_drive_block() {
        let gw = MockGateway::new(&[1]);
        let transport = Transport::open("mock0", 115200, Box::new(gw.adapter()));
        let mut session = MotorSession::connect(&transport, 1).unwrap();

        let params = ExtensionParams::new()
            .set("speed_limit_rpm", 1500)
            .set("stall_current_ma", 2100);
        session.apply_extension_params(&params, false).unwrap();

        let block = session.read_drive_parameters().unwrap();
        assert_eq!(block.speed_limit_rpm, 1500);
        assert_eq!(block.stall_current_ma, 2100);
        // 未触及的字段保持原值
        assert_eq!(block.open_loop_ma, DriveParameters::default().open_loop_ma);
    }

    #[test]
    fn test_invalid_params_never_reach_wire() {
        let gw = MockGateway::new(&[1]);
        let transport = Transport::open("mock0", 115200, Box::new(gw.adapter()));
        let mut session = MotorSession::connect(&transport, 1).unwrap();

        let frames_before = gw.written_frames().len();
        let params = ExtensionParams::new().set("bogus", 1);
        assert!(session.apply_extension_params(&params, false).is_err());
        assert_eq!(gw.written_frames().len(), frames_before);
    }
}
