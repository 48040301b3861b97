use crate::store::{Document, Snapshot};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const STUDENTS: &str = "students";
pub const ACTIVITIES: &str = "activities";
pub const LOGS: &str = "logs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    Sahur,
    Puasa,
    SholatSubuh,
    SholatZuhur,
    SholatAshar,
    SholatMaghrib,
    SholatIsya,
    Tadarus,
    SholatTarawih,
}

impl ActivityType {
    /// Canonical order, also the export column order.
    pub const ALL: [ActivityType; 9] = [
        ActivityType::Sahur,
        ActivityType::Puasa,
        ActivityType::SholatSubuh,
        ActivityType::SholatZuhur,
        ActivityType::SholatAshar,
        ActivityType::SholatMaghrib,
        ActivityType::SholatIsya,
        ActivityType::Tadarus,
        ActivityType::SholatTarawih,
    ];

    pub const PRAYERS: [ActivityType; 5] = [
        ActivityType::SholatSubuh,
        ActivityType::SholatZuhur,
        ActivityType::SholatAshar,
        ActivityType::SholatMaghrib,
        ActivityType::SholatIsya,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sahur" => Some(Self::Sahur),
            "puasa" => Some(Self::Puasa),
            "sholat_subuh" => Some(Self::SholatSubuh),
            "sholat_zuhur" => Some(Self::SholatZuhur),
            "sholat_ashar" => Some(Self::SholatAshar),
            "sholat_maghrib" => Some(Self::SholatMaghrib),
            "sholat_isya" => Some(Self::SholatIsya),
            "tadarus" => Some(Self::Tadarus),
            "sholat_tarawih" => Some(Self::SholatTarawih),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sahur => "sahur",
            Self::Puasa => "puasa",
            Self::SholatSubuh => "sholat_subuh",
            Self::SholatZuhur => "sholat_zuhur",
            Self::SholatAshar => "sholat_ashar",
            Self::SholatMaghrib => "sholat_maghrib",
            Self::SholatIsya => "sholat_isya",
            Self::Tadarus => "tadarus",
            Self::SholatTarawih => "sholat_tarawih",
        }
    }

    /// Column title used in exported sheets.
    pub fn label(self) -> &'static str {
        match self {
            Self::Sahur => "Sahur",
            Self::Puasa => "Puasa",
            Self::SholatSubuh => "Sholat Subuh",
            Self::SholatZuhur => "Sholat Zuhur",
            Self::SholatAshar => "Sholat Ashar",
            Self::SholatMaghrib => "Sholat Maghrib",
            Self::SholatIsya => "Sholat Isya",
            Self::Tadarus => "Tadarus",
            Self::SholatTarawih => "Sholat Tarawih",
        }
    }

    pub fn is_prayer(self) -> bool {
        Self::PRAYERS.contains(&self)
    }

    pub fn takes_note(self) -> bool {
        self == Self::Tadarus
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Done,
    Pending,
}

impl ActivityStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "done" => Some(Self::Done),
            "pending" => Some(Self::Pending),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Pending => "pending",
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            Self::Done => Self::Pending,
            Self::Pending => Self::Done,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: String,
    pub name: String,
    pub class: String,
}

impl Student {
    /// Maps a stored document, or `None` when a required field is missing or
    /// blank.
    pub fn from_snapshot(snap: &Snapshot) -> Option<Self> {
        let name = snap.str_field("name")?.trim();
        let class = snap.str_field("class")?.trim();
        if name.is_empty() || class.is_empty() {
            return None;
        }
        Some(Self {
            id: snap.id.clone(),
            name: name.to_string(),
            class: class.to_ascii_uppercase(),
        })
    }

    pub fn to_document(name: &str, class: &str) -> Document {
        as_document(json!({ "name": name, "class": class }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub id: String,
    pub student_id: String,
    pub date: String,
    #[serde(rename = "type")]
    pub activity_type: ActivityType,
    pub status: ActivityStatus,
    pub note: String,
}

impl Activity {
    pub fn from_snapshot(snap: &Snapshot) -> Option<Self> {
        let student_id = snap.str_field("studentId")?;
        let date = crate::normalize::normalize_date(snap.str_field("date")?)?;
        let activity_type = ActivityType::parse(snap.str_field("type")?)?;
        let status = ActivityStatus::parse(snap.str_field("status")?)?;
        if student_id.is_empty() {
            return None;
        }
        Some(Self {
            id: snap.id.clone(),
            student_id: student_id.to_string(),
            date,
            activity_type,
            status,
            note: snap.str_field("note").unwrap_or("").to_string(),
        })
    }

    pub fn is_done(&self) -> bool {
        self.status == ActivityStatus::Done
    }

    pub fn to_document(&self) -> Document {
        as_document(json!({
            "studentId": self.student_id,
            "date": self.date,
            "type": self.activity_type.as_str(),
            "status": self.status.as_str(),
            "note": self.note,
        }))
    }

    pub fn key(&self) -> ActivityKey {
        ActivityKey {
            student_id: self.student_id.clone(),
            date: self.date.clone(),
            activity_type: self.activity_type,
        }
    }
}

/// Identity of an activity: one record per student, date and type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActivityKey {
    pub student_id: String,
    pub date: String,
    pub activity_type: ActivityType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivityFilter {
    pub student_id: Option<String>,
    pub date: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    Student,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    #[serde(rename = "type")]
    pub actor_type: ActorType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
}

impl Actor {
    pub fn admin(name: &str) -> Self {
        Self {
            actor_type: ActorType::Admin,
            id: None,
            name: name.to_string(),
        }
    }

    pub fn student(student: &Student) -> Self {
        Self {
            actor_type: ActorType::Student,
            id: Some(student.id.clone()),
            name: student.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogAction {
    AddStudent,
    EditStudent,
    DeleteStudent,
    SeedStudents,
    ToggleActivity,
    UpdateNote,
    UpsertActivity,
    DeleteActivities,
    ClearActivities,
    ImportActivities,
    ExportActivities,
    ResetData,
    StudentLogin,
    StudentLogout,
}

impl LogAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AddStudent => "add_student",
            Self::EditStudent => "edit_student",
            Self::DeleteStudent => "delete_student",
            Self::SeedStudents => "seed_students",
            Self::ToggleActivity => "toggle_activity",
            Self::UpdateNote => "update_note",
            Self::UpsertActivity => "upsert_activity",
            Self::DeleteActivities => "delete_activities",
            Self::ClearActivities => "clear_activities",
            Self::ImportActivities => "import_activities",
            Self::ExportActivities => "export_activities",
            Self::ResetData => "reset_data",
            Self::StudentLogin => "student_login",
            Self::StudentLogout => "student_logout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: String,
    pub action: String,
    pub actor: Actor,
    pub details: Value,
    pub timestamp: String,
    pub date: String,
    pub user_agent: String,
}

impl LogEntry {
    pub fn from_snapshot(snap: &Snapshot) -> Option<Self> {
        let action = snap.str_field("action")?.to_string();
        let actor: Actor = serde_json::from_value(snap.data.get("actor")?.clone()).ok()?;
        Some(Self {
            id: snap.id.clone(),
            action,
            actor,
            details: snap.data.get("details").cloned().unwrap_or(Value::Null),
            timestamp: snap.str_field("timestamp").unwrap_or("").to_string(),
            date: snap.str_field("date").unwrap_or("").to_string(),
            user_agent: snap.str_field("userAgent").unwrap_or("").to_string(),
        })
    }
}

pub fn as_document(v: Value) -> Document {
    match v {
        Value::Object(m) => m,
        _ => Document::new(),
    }
}
