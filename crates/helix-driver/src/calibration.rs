//! 关节标定系数与配置加载
//!
//! 每个电机地址对应一组 `(减速比, 方向符号)`，用于在驱动板上报的
//! 电机角与外部有意义的关节角之间换算。核心层把系数当作不透明的
//! 标定量，只在读写边界处应用，不解释其物理含义。
//!
//! 换算关系（direction ∈ {+1, -1}）：
//!
//! ```text
//! joint = direction * motor / reduction_ratio
//! motor = direction * joint * reduction_ratio
//! ```

use crate::error::DriverError;
use serde::Deserialize;
use std::collections::HashMap;

/// 单关节标定系数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JointCalibration {
    reduction_ratio: f64,
    direction: i8,
}

impl Default for JointCalibration {
    /// 恒等标定（直驱，正方向）
    fn default() -> Self {
        Self {
            reduction_ratio: 1.0,
            direction: 1,
        }
    }
}

impl JointCalibration {
    /// 创建标定系数
    ///
    /// 减速比必须是非零有限值，方向只能是 ±1。
    pub fn new(reduction_ratio: f64, direction: i8) -> Result<Self, DriverError> {
        if !reduction_ratio.is_finite() || reduction_ratio == 0.0 {
            return Err(DriverError::Config(format!(
                "reduction_ratio must be finite and non-zero, got {reduction_ratio}"
            )));
        }
        if direction != 1 && direction != -1 {
            return Err(DriverError::Config(format!(
                "direction must be +1 or -1, got {direction}"
            )));
        }
        Ok(Self {
            reduction_ratio,
            direction,
        })
    }

    /// 减速比
    pub fn reduction_ratio(&self) -> f64 {
        self.reduction_ratio
    }

    /// 方向符号
    pub fn direction(&self) -> i8 {
        self.direction
    }

    /// 关节角 → 电机角（写边界）
    pub fn joint_to_motor(&self, joint: f64) -> f64 {
        self.direction as f64 * joint * self.reduction_ratio
    }

    /// 电机角 → 关节角（读边界）
    pub fn motor_to_joint(&self, motor: f64) -> f64 {
        self.direction as f64 * motor / self.reduction_ratio
    }
}

#[derive(Debug, Deserialize)]
struct JointEntry {
    motor_id: u8,
    reduction_ratio: f64,
    direction: i8,
}

#[derive(Debug, Deserialize)]
struct RawArmConfig {
    #[serde(default)]
    joints: Vec<JointEntry>,
}

/// 整臂标定配置
///
/// TOML 形如：
///
/// ```toml
/// [[joints]]
/// motor_id = 1
/// reduction_ratio = 50.0
/// direction = -1
///
/// [[joints]]
/// motor_id = 2
/// reduction_ratio = 36.0
/// direction = 1
/// ```
#[derive(Debug, Clone, Default)]
pub struct ArmConfig {
    joints: HashMap<u8, JointCalibration>,
}

impl ArmConfig {
    /// 从 TOML 文本解析
    pub fn from_toml_str(text: &str) -> Result<Self, DriverError> {
        let raw: RawArmConfig =
            toml::from_str(text).map_err(|e| DriverError::Config(e.to_string()))?;

        let mut joints = HashMap::new();
        for entry in raw.joints {
            let cal = JointCalibration::new(entry.reduction_ratio, entry.direction)?;
            if joints.insert(entry.motor_id, cal).is_some() {
                return Err(DriverError::Config(format!(
                    "duplicate calibration entry for motor {}",
                    entry.motor_id
                )));
            }
        }
        Ok(Self { joints })
    }

    /// 从文件加载
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, DriverError> {
        let text = std::fs::read_to_string(path).map_err(|e| DriverError::Config(e.to_string()))?;
        Self::from_toml_str(&text)
    }

    /// 查某个电机的标定系数；未配置的地址使用恒等标定
    pub fn calibration_for(&self, motor_id: u8) -> JointCalibration {
        self.joints.get(&motor_id).copied().unwrap_or_default()
    }
}
