//! Debt-registration payloads for the credit bureau API.

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// `controle` value registering a debt.
pub const CONTROLE_INCLUSAO: &str = "1";
/// `controle` value clearing a debt.
pub const CONTROLE_BAIXA: &str = "2";
pub const DEFAULT_WEBSERVICE: &str = "S";

/// One input row as read from the warehouse export.
pub type Row = Map<String, Value>;

/// Body of one registration or clearance request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NegativacaoPayload {
    pub nome: String,
    pub cpf: String,
    pub endereco: String,
    pub bairro: String,
    pub cidade: String,
    pub cep: String,
    pub estado: String,
    pub contrato: String,
    pub datavencimento: String,
    pub datavenda: String,
    pub valor: String,
    pub webservice: String,
    pub controle: String,
}

/// Turn rows into payloads for `execution_date`.
///
/// A row whose `data_inclusao` is the execution date yields a registration
/// (`controle = "1"`); one whose `data_baixa` is the execution date yields a
/// clearance (`controle = "2"`). A row may yield both, registration first.
/// Absent or null text fields become `""`, `webservice` becomes `"S"`.
///
/// A row with an unparseable date is logged and skipped; the rest of the
/// batch still goes out.
pub fn prepare_negativacao_payloads(
    rows: &[Row],
    execution_date: NaiveDate,
) -> Vec<NegativacaoPayload> {
    let mut payloads = Vec::new();
    let mut skipped = 0;
    for (index, row) in rows.iter().enumerate() {
        let dates = row_date(row, "data_inclusao")
            .and_then(|inclusao| Ok((inclusao, row_date(row, "data_baixa")?)));
        let (inclusao, baixa) = match dates {
            Ok(dates) => dates,
            Err(reason) => {
                warn!(index, %reason, "row skipped");
                skipped += 1;
                continue;
            }
        };
        if inclusao != Some(execution_date) && baixa != Some(execution_date) {
            continue;
        }

        let text = |key: &str| text_field(row, key).unwrap_or_default();
        let base = NegativacaoPayload {
            nome: text("nome"),
            cpf: text("cpf"),
            endereco: text("endereco"),
            bairro: text("bairro"),
            cidade: text("cidade"),
            cep: text("cep"),
            estado: text("estado"),
            contrato: text("contrato"),
            datavencimento: text("datavencimento"),
            datavenda: text("datavenda"),
            valor: text("valor"),
            webservice: text_field(row, "webservice")
                .unwrap_or_else(|| DEFAULT_WEBSERVICE.to_string()),
            controle: String::new(),
        };

        if inclusao == Some(execution_date) {
            payloads.push(NegativacaoPayload {
                controle: CONTROLE_INCLUSAO.to_string(),
                ..base.clone()
            });
        }
        if baixa == Some(execution_date) {
            payloads.push(NegativacaoPayload {
                controle: CONTROLE_BAIXA.to_string(),
                ..base
            });
        }
    }
    debug!(
        rows = rows.len(),
        payloads = payloads.len(),
        skipped,
        %execution_date,
        "payloads prepared"
    );
    payloads
}

/// Strings as-is, numbers and booleans rendered, null or absent as `None`.
fn text_field(row: &Row, key: &str) -> Option<String> {
    match row.get(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// A date column: `YYYY-MM-DD`, optionally followed by a time part.
fn row_date(row: &Row, key: &str) -> Result<Option<NaiveDate>, String> {
    let Some(raw) = text_field(row, key) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let date_part = trimmed.get(..10).unwrap_or(trimmed);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .map(Some)
        .map_err(|_| format!("{key} '{raw}' is not a date"))
}
