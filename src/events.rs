//! Messages exchanged between the sales and inventory services.
//!
//! Every payload is serialized as a bare JSON object with PascalCase field
//! names. Money is a [`Decimal`] written as an exact string, timestamps are
//! RFC 3339 in UTC.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Queue names shared by every service.
pub mod queues {
    pub const VENDA_REGISTRADA: &str = "venda.registrada";
    pub const ESTOQUE_ALTERADO: &str = "estoque.alterado";
    pub const PRODUTO_CRIADO: &str = "produto.criado";
    pub const VERIFICAR_ESTOQUE: &str = "estoque.verificar";
    pub const ESTOQUE_VERIFICADO: &str = "estoque.verificado";

    pub const ALL: [&str; 5] = [
        VENDA_REGISTRADA,
        ESTOQUE_ALTERADO,
        PRODUTO_CRIADO,
        VERIFICAR_ESTOQUE,
        ESTOQUE_VERIFICADO,
    ];
}

/// Published by sales once a sale has been committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VendaRegistradaEvent {
    pub venda_id: i32,
    pub produto_id: i32,
    pub quantidade: i32,
    pub cliente: String,
    pub data_venda: DateTime<Utc>,
    pub valor_total: Decimal,
}

/// Kind of stock movement carried by [`EstoqueAlteradoEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TipoMovimentacao {
    Entrada,
    Saida,
    Ajuste,
    Venda,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EstoqueAlteradoEvent {
    pub produto_id: i32,
    pub quantidade_anterior: i32,
    pub quantidade_atual: i32,
    pub tipo_movimentacao: TipoMovimentacao,
    pub data_alteracao: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProdutoCriadoEvent {
    pub produto_id: i32,
    pub nome: String,
    pub preco: Decimal,
    pub quantidade_estoque: i32,
    pub data_criacao: DateTime<Utc>,
}

/// Asks inventory whether `quantidade_solicitada` units are available.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VerificarEstoqueCommand {
    pub produto_id: i32,
    pub quantidade_solicitada: i32,
    pub correlation_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EstoqueVerificadoResponse {
    pub correlation_id: String,
    pub disponibilidade_suficiente: bool,
    pub quantidade_disponivel: i32,
    pub mensagem: String,
}
