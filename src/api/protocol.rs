use serde::{Deserialize, Serialize};

/// Opaque 8-hex token identifying one SOL through its final RES.
pub type TransactionId = String;

/// Fresh transaction id, 8 hex chars.
pub fn new_transaction_id() -> TransactionId {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// What a program asks its faculty for.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProgramRequest {
    pub programa: String,
    pub salones: u32,
    pub laboratorios: u32,
}

/// The room counts the broker offers for one SOL.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Proposal {
    pub salones_propuestos: u32,
    pub laboratorios_propuestos: u32,
    pub aulas_moviles: u32,
}

impl Proposal {
    /// Total rooms the proposal would occupy.
    pub fn total_rooms(&self) -> u32 {
        self.salones_propuestos + self.laboratorios_propuestos + self.aulas_moviles
    }

    pub fn is_empty(&self) -> bool {
        self.total_rooms() == 0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    #[serde(rename = "ACCEPT")]
    Accept,
    #[serde(rename = "REJECT")]
    Reject,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResStatus {
    Accepted,
    Denied,
    Canceled,
    ErrorFacultyNoServer,
    ErrorFacultySendFailed,
    ErrorFacultyTimeout,
    ErrorFacultyDecodeError,
    ErrorFacultyUnexpectedFinalRes,
}

impl ResStatus {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ResStatus::Accepted)
    }

    /// Wire spelling of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResStatus::Accepted => "ACCEPTED",
            ResStatus::Denied => "DENIED",
            ResStatus::Canceled => "CANCELED",
            ResStatus::ErrorFacultyNoServer => "ERROR_FACULTY_NO_SERVER",
            ResStatus::ErrorFacultySendFailed => "ERROR_FACULTY_SEND_FAILED",
            ResStatus::ErrorFacultyTimeout => "ERROR_FACULTY_TIMEOUT",
            ResStatus::ErrorFacultyDecodeError => "ERROR_FACULTY_DECODE_ERROR",
            ResStatus::ErrorFacultyUnexpectedFinalRes => "ERROR_FACULTY_UNEXPECTED_FINAL_RES",
        }
    }
}

impl std::fmt::Display for ResStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final outcome of a transaction, delivered verbatim to the program.
/// The proposal counts are present only on ACCEPTED.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Resolution {
    pub status: ResStatus,
    pub transaction_id: TransactionId,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub salones_propuestos: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub laboratorios_propuestos: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub aulas_moviles: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,
}

impl Resolution {
    fn bare(status: ResStatus, transaction_id: TransactionId, reason: Option<String>) -> Self {
        Self { status, transaction_id, salones_propuestos: None, laboratorios_propuestos: None, aulas_moviles: None, reason }
    }

    pub fn accepted(transaction_id: TransactionId, proposal: Proposal) -> Self {
        Self {
            status: ResStatus::Accepted,
            transaction_id,
            salones_propuestos: Some(proposal.salones_propuestos),
            laboratorios_propuestos: Some(proposal.laboratorios_propuestos),
            aulas_moviles: Some(proposal.aulas_moviles),
            reason: None,
        }
    }

    pub fn denied(transaction_id: TransactionId, reason: impl Into<String>) -> Self {
        Self::bare(ResStatus::Denied, transaction_id, Some(reason.into()))
    }

    pub fn canceled(transaction_id: TransactionId, reason: impl Into<String>) -> Self {
        Self::bare(ResStatus::Canceled, transaction_id, Some(reason.into()))
    }

    /// Synthetic RES the gateway emits when the broker exchange broke down.
    pub fn gateway_error(transaction_id: TransactionId, status: ResStatus, reason: impl Into<String>) -> Self {
        Self::bare(status, transaction_id, Some(reason.into()))
    }

    /// The proposal triple, when all three counts are present.
    pub fn proposal(&self) -> Option<Proposal> {
        match (self.salones_propuestos, self.laboratorios_propuestos, self.aulas_moviles) {
            (Some(salones_propuestos), Some(laboratorios_propuestos), Some(aulas_moviles)) => {
                Some(Proposal { salones_propuestos, laboratorios_propuestos, aulas_moviles })
            }
            _ => None,
        }
    }
}

/// The allocation protocol, discriminated on the wire by `tipo`.
/// Parsed once at ingress; everything downstream matches on the variant.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "tipo")]
pub enum Message {
    #[serde(rename = "SOL")]
    Sol {
        transaction_id: TransactionId,
        programa: String,
        salones: u32,
        laboratorios: u32,
        faculty_id: i64,
        program_id: i64,
        facultad: String,
        semester: String,
    },
    #[serde(rename = "PROP")]
    Prop { transaction_id: TransactionId, data: Proposal },
    #[serde(rename = "ACK")]
    Ack {
        transaction_id: TransactionId,
        confirm: AckDecision,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        reason: Option<String>,
    },
    #[serde(rename = "RES")]
    Res(Resolution),
}

impl Message {
    pub fn transaction_id(&self) -> &str {
        match self {
            Message::Sol { transaction_id, .. }
            | Message::Prop { transaction_id, .. }
            | Message::Ack { transaction_id, .. } => transaction_id,
            Message::Res(res) => &res.transaction_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_ids_are_8_hex() {
        let id = new_transaction_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_transaction_id());
    }

    #[test]
    fn sol_round_trips_with_tipo_tag() {
        let sol = Message::Sol {
            transaction_id: "deadbeef".into(),
            programa: "IngSw".into(),
            salones: 3,
            laboratorios: 1,
            faculty_id: 7,
            program_id: 1,
            facultad: "Ingenieria".into(),
            semester: "2025-2".into(),
        };
        let json = serde_json::to_value(&sol).unwrap();
        assert_eq!(json["tipo"], "SOL");
        assert_eq!(json["salones"], 3);
        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, sol);
    }

    #[test]
    fn accepted_res_flattens_the_proposal() {
        let res = Resolution::accepted("cafe0000".into(), Proposal { salones_propuestos: 2, laboratorios_propuestos: 0, aulas_moviles: 2 });
        let json = serde_json::to_value(Message::Res(res.clone())).unwrap();
        assert_eq!(json["tipo"], "RES");
        assert_eq!(json["status"], "ACCEPTED");
        assert_eq!(json["aulas_moviles"], 2);
        assert!(json.get("reason").is_none());
        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, Message::Res(res));
    }

    #[test]
    fn denied_res_has_reason_and_no_proposal() {
        let res = Resolution::denied("cafe0001".into(), "No hay suficientes aulas libres");
        let json = serde_json::to_value(&res).unwrap();
        assert_eq!(json["status"], "DENIED");
        assert!(json.get("salones_propuestos").is_none());
        let back: Resolution = serde_json::from_value(json).unwrap();
        assert_eq!(back.proposal(), None);
    }

    #[test]
    fn error_statuses_use_the_wire_spelling() {
        let res = Resolution::gateway_error("00000000".into(), ResStatus::ErrorFacultyNoServer, "No active server");
        let json = serde_json::to_value(&res).unwrap();
        assert_eq!(json["status"], "ERROR_FACULTY_NO_SERVER");
    }
}
