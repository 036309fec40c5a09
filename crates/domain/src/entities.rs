use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 渐进发布环，按爆炸半径从小到大排序
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Ring {
    #[serde(rename = "canary")]
    Canary,
    #[serde(rename = "dev")]
    Dev,
    #[serde(rename = "stage")]
    Stage,
    #[serde(rename = "prod")]
    Prod,
}

impl Ring {
    pub const ALL: [Ring; 4] = [Ring::Canary, Ring::Dev, Ring::Stage, Ring::Prod];

    pub fn as_str(&self) -> &'static str {
        match self {
            Ring::Canary => "canary",
            Ring::Dev => "dev",
            Ring::Stage => "stage",
            Ring::Prod => "prod",
        }
    }
}

impl std::fmt::Display for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 设备健康快照，由Slave端采集并上报
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceStatus {
    pub battery_level: f64, // 0-100
    pub battery_charging: bool,
    pub cpu_usage: f64,    // 0-100
    pub memory_usage: f64, // 0-100
    pub disk_usage: f64,   // 0-100
    pub device_name: String,
    pub os_version: String,
    pub collected_at: DateTime<Utc>,
}

impl DeviceStatus {
    pub fn new(device_name: impl Into<String>) -> Self {
        Self {
            battery_level: 100.0,
            battery_charging: false,
            cpu_usage: 0.0,
            memory_usage: 0.0,
            disk_usage: 0.0,
            device_name: device_name.into(),
            os_version: "unknown".to_string(),
            collected_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlaveStatus {
    Registered,
    Idle,
    Busy,
    Dead,
}

impl std::fmt::Display for SlaveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SlaveStatus::Registered => "REGISTERED",
            SlaveStatus::Idle => "IDLE",
            SlaveStatus::Busy => "BUSY",
            SlaveStatus::Dead => "DEAD",
        };
        f.write_str(s)
    }
}

/// Master侧维护的Slave节点信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveInfo {
    pub id: String,
    pub capabilities: Vec<String>, // 可执行的任务类型标签
    pub status: SlaveStatus,
    pub ring: Ring,
    pub device: DeviceStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub current_task: Option<String>,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
}

impl SlaveInfo {
    pub fn new(id: String, capabilities: Vec<String>, device: DeviceStatus, ring: Ring) -> Self {
        let now = Utc::now();
        Self {
            id,
            capabilities,
            status: SlaveStatus::Registered,
            ring,
            device,
            last_heartbeat: now,
            registered_at: now,
            current_task: None,
            completed_tasks: 0,
            failed_tasks: 0,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.status != SlaveStatus::Dead
    }

    pub fn is_idle(&self) -> bool {
        self.status == SlaveStatus::Idle
    }

    pub fn can_run(&self, task_type: &str) -> bool {
        self.capabilities.iter().any(|c| c == task_type)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Assigned => "ASSIGNED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_type: String,
    pub parameters: serde_json::Value,
    pub priority: i32, // 数值越大越先派发
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub assigned_to: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub seq: u64, // 提交序号，同优先级FIFO裁决
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        task_type: String,
        parameters: serde_json::Value,
        priority: i32,
        max_retries: u32,
        seq: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            task_type,
            parameters,
            priority,
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries,
            assigned_to: None,
            result: None,
            error: None,
            seq,
            created_at: now,
            updated_at: now,
        }
    }
}

/// 消息接收方：点对点或广播
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Recipient {
    Agent(String),
    Broadcast,
}

/// 消息载荷，按消息类型携带结构化内容
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessagePayload {
    #[serde(rename = "REGISTRATION")]
    Registration {
        capabilities: Vec<String>,
        device: DeviceStatus,
    },
    #[serde(rename = "ACK")]
    Ack { accepted: bool, detail: String },
    #[serde(rename = "TASK_ASSIGNMENT")]
    TaskAssignment {
        task_id: String,
        task_type: String,
        parameters: serde_json::Value,
        priority: i32,
        retry_count: u32,
    },
    #[serde(rename = "TASK_STATUS")]
    TaskProgress {
        task_id: String,
        stage: String,
        percent: u8,
    },
    #[serde(rename = "TASK_RESULT")]
    TaskResult {
        task_id: String,
        result: serde_json::Value,
    },
    #[serde(rename = "ERROR")]
    Error {
        task_id: Option<String>,
        error: String,
    },
    #[serde(rename = "HEARTBEAT")]
    Heartbeat { device: Option<DeviceStatus> },
    #[serde(rename = "DEVICE_STATUS_UPDATE")]
    DeviceStatusUpdate { device: DeviceStatus },
    #[serde(rename = "RING_ASSIGNMENT")]
    RingAssignment { ring: Ring, reason: String },
    #[serde(rename = "SHUTDOWN")]
    Shutdown { reason: String },
}

/// 通信单元，发送后不可变
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender: String,
    pub recipient: Recipient,
    pub payload: MessagePayload,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(sender: impl Into<String>, recipient: Recipient, payload: MessagePayload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender: sender.into(),
            recipient,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn to_agent(
        sender: impl Into<String>,
        receiver: impl Into<String>,
        payload: MessagePayload,
    ) -> Self {
        Self::new(sender, Recipient::Agent(receiver.into()), payload)
    }

    pub fn registration(
        slave_id: impl Into<String>,
        master_id: impl Into<String>,
        capabilities: Vec<String>,
        device: DeviceStatus,
    ) -> Self {
        Self::to_agent(
            slave_id,
            master_id,
            MessagePayload::Registration {
                capabilities,
                device,
            },
        )
    }

    pub fn ack(
        master_id: impl Into<String>,
        slave_id: impl Into<String>,
        accepted: bool,
        detail: impl Into<String>,
    ) -> Self {
        Self::to_agent(
            master_id,
            slave_id,
            MessagePayload::Ack {
                accepted,
                detail: detail.into(),
            },
        )
    }

    pub fn task_assignment(master_id: impl Into<String>, slave_id: impl Into<String>, task: &Task) -> Self {
        Self::to_agent(
            master_id,
            slave_id,
            MessagePayload::TaskAssignment {
                task_id: task.id.clone(),
                task_type: task.task_type.clone(),
                parameters: task.parameters.clone(),
                priority: task.priority,
                retry_count: task.retry_count,
            },
        )
    }

    pub fn task_progress(
        slave_id: impl Into<String>,
        master_id: impl Into<String>,
        task_id: impl Into<String>,
        stage: impl Into<String>,
        percent: u8,
    ) -> Self {
        Self::to_agent(
            slave_id,
            master_id,
            MessagePayload::TaskProgress {
                task_id: task_id.into(),
                stage: stage.into(),
                percent,
            },
        )
    }

    pub fn task_result(
        slave_id: impl Into<String>,
        master_id: impl Into<String>,
        task_id: impl Into<String>,
        result: serde_json::Value,
    ) -> Self {
        Self::to_agent(
            slave_id,
            master_id,
            MessagePayload::TaskResult {
                task_id: task_id.into(),
                result,
            },
        )
    }

    pub fn task_error(
        slave_id: impl Into<String>,
        master_id: impl Into<String>,
        task_id: Option<String>,
        error: impl Into<String>,
    ) -> Self {
        Self::to_agent(
            slave_id,
            master_id,
            MessagePayload::Error {
                task_id,
                error: error.into(),
            },
        )
    }

    pub fn heartbeat(
        slave_id: impl Into<String>,
        master_id: impl Into<String>,
        device: Option<DeviceStatus>,
    ) -> Self {
        Self::to_agent(slave_id, master_id, MessagePayload::Heartbeat { device })
    }

    pub fn device_status_update(
        slave_id: impl Into<String>,
        master_id: impl Into<String>,
        device: DeviceStatus,
    ) -> Self {
        Self::to_agent(
            slave_id,
            master_id,
            MessagePayload::DeviceStatusUpdate { device },
        )
    }

    pub fn ring_assignment(
        master_id: impl Into<String>,
        slave_id: impl Into<String>,
        ring: Ring,
        reason: impl Into<String>,
    ) -> Self {
        Self::to_agent(
            master_id,
            slave_id,
            MessagePayload::RingAssignment {
                ring,
                reason: reason.into(),
            },
        )
    }

    pub fn shutdown_broadcast(master_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(
            master_id,
            Recipient::Broadcast,
            MessagePayload::Shutdown {
                reason: reason.into(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_serde_values() {
        assert_eq!(serde_json::to_string(&Ring::Canary).unwrap(), "\"canary\"");
        assert_eq!(serde_json::to_string(&Ring::Prod).unwrap(), "\"prod\"");
        let ring: Ring = serde_json::from_str("\"stage\"").unwrap();
        assert_eq!(ring, Ring::Stage);
    }

    #[test]
    fn test_ring_ordering_by_blast_radius() {
        assert!(Ring::Canary < Ring::Dev);
        assert!(Ring::Dev < Ring::Stage);
        assert!(Ring::Stage < Ring::Prod);
    }

    #[test]
    fn test_task_new_is_pending() {
        let task = Task::new("health_check".into(), serde_json::json!({}), 5, 3, 7);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.seq, 7);
        assert!(task.assigned_to.is_none());
        assert!(!task.status.is_terminal());
    }

    #[test]
    fn test_slave_capability_matching() {
        let device = DeviceStatus::new("dev-1");
        let slave = SlaveInfo::new(
            "slave-1".into(),
            vec!["health_check".into(), "monitor".into()],
            device,
            Ring::Dev,
        );
        assert!(slave.can_run("monitor"));
        assert!(!slave.can_run("transcode"));
        assert_eq!(slave.status, SlaveStatus::Registered);
        assert!(slave.is_alive());
        assert!(!slave.is_idle());
    }

    #[test]
    fn test_message_payload_tag_roundtrip() {
        let msg = Message::heartbeat("slave-1", "master-001", None);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["payload"]["type"], "HEARTBEAT");

        let parsed: Message = serde_json::from_value(json).unwrap();
        assert!(matches!(
            parsed.payload,
            MessagePayload::Heartbeat { device: None }
        ));
        assert_eq!(parsed.recipient, Recipient::Agent("master-001".into()));
    }

    #[test]
    fn test_task_assignment_message_carries_task_fields() {
        let task = Task::new("monitor".into(), serde_json::json!({"target": "eu-1"}), 2, 1, 0);
        let msg = Message::task_assignment("master-001", "slave-1", &task);
        match msg.payload {
            MessagePayload::TaskAssignment {
                ref task_id,
                ref task_type,
                priority,
                ..
            } => {
                assert_eq!(task_id, &task.id);
                assert_eq!(task_type, "monitor");
                assert_eq!(priority, 2);
            }
            _ => panic!("unexpected payload"),
        }
    }
}
