//! Stock bookkeeping on the inventory side.
//!
//! The ledger is plain state; the `inventory` command of the binary feeds it
//! from `produto.criado` and `venda.registrada` and publishes what it returns.

use std::collections::HashMap;

use chrono::Utc;
use tracing::{info, warn};

use crate::events::{
    EstoqueAlteradoEvent, EstoqueVerificadoResponse, ProdutoCriadoEvent, TipoMovimentacao,
    VendaRegistradaEvent, VerificarEstoqueCommand,
};
use crate::utils::error::InventoryError;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ProductStock {
    nome: String,
    quantidade: i32,
}

#[derive(Debug, Default)]
pub struct StockLedger {
    products: HashMap<i32, ProductStock>,
}

impl StockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a newly created product with its initial stock. A product
    /// seen again is overwritten.
    pub fn register_product(&mut self, event: &ProdutoCriadoEvent) {
        let previous = self.products.insert(
            event.produto_id,
            ProductStock {
                nome: event.nome.clone(),
                quantidade: event.quantidade_estoque.max(0),
            },
        );
        if previous.is_some() {
            warn!(produto_id = event.produto_id, "product registered again, stock reset");
        } else {
            info!(
                produto_id = event.produto_id,
                nome = %event.nome,
                quantidade = event.quantidade_estoque,
                "product registered"
            );
        }
    }

    /// Takes the sold units out of stock and describes the movement.
    ///
    /// Stock never goes negative: a sale larger than the stock is refused
    /// and nothing changes.
    pub fn apply_sale(
        &mut self,
        sale: &VendaRegistradaEvent,
    ) -> Result<EstoqueAlteradoEvent, InventoryError> {
        if sale.quantidade <= 0 {
            return Err(InventoryError::InvalidQuantity(sale.quantidade));
        }
        let product = self
            .products
            .get_mut(&sale.produto_id)
            .ok_or(InventoryError::UnknownProduct(sale.produto_id))?;
        if product.quantidade < sale.quantidade {
            return Err(InventoryError::InsufficientStock {
                produto_id: sale.produto_id,
                available: product.quantidade,
                requested: sale.quantidade,
            });
        }

        let quantidade_anterior = product.quantidade;
        product.quantidade -= sale.quantidade;
        info!(
            venda_id = sale.venda_id,
            produto_id = sale.produto_id,
            from = quantidade_anterior,
            to = product.quantidade,
            "stock decremented for sale"
        );

        Ok(EstoqueAlteradoEvent {
            produto_id: sale.produto_id,
            quantidade_anterior,
            quantidade_atual: product.quantidade,
            tipo_movimentacao: TipoMovimentacao::Venda,
            data_alteracao: Utc::now(),
        })
    }

    /// Answers whether the requested quantity is available. The correlation
    /// id is copied from the command.
    pub fn check(&self, command: &VerificarEstoqueCommand) -> EstoqueVerificadoResponse {
        let (disponibilidade_suficiente, quantidade_disponivel, mensagem) =
            match self.products.get(&command.produto_id) {
                None => (false, 0, "Produto não encontrado".to_string()),
                Some(p) if p.quantidade >= command.quantidade_solicitada => {
                    (true, p.quantidade, "Estoque suficiente".to_string())
                }
                Some(p) => (
                    false,
                    p.quantidade,
                    format!("Estoque insuficiente para {}", p.nome),
                ),
            };

        EstoqueVerificadoResponse {
            correlation_id: command.correlation_id.clone(),
            disponibilidade_suficiente,
            quantidade_disponivel,
            mensagem,
        }
    }

    pub fn quantity(&self, produto_id: i32) -> Option<i32> {
        self.products.get(&produto_id).map(|p| p.quantidade)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use rust_decimal::Decimal;

    use super::*;

    fn product(produto_id: i32, quantidade_estoque: i32) -> ProdutoCriadoEvent {
        ProdutoCriadoEvent {
            produto_id,
            nome: "Teclado".to_string(),
            preco: Decimal::from_str("50.00").unwrap(),
            quantidade_estoque,
            data_criacao: Utc::now(),
        }
    }

    fn sale(produto_id: i32, quantidade: i32) -> VendaRegistradaEvent {
        VendaRegistradaEvent {
            venda_id: 1,
            produto_id,
            quantidade,
            cliente: "Ana".to_string(),
            data_venda: Utc::now(),
            valor_total: Decimal::from_str("150.00").unwrap(),
        }
    }

    #[test]
    fn sale_decrements_stock() {
        let mut ledger = StockLedger::new();
        ledger.register_product(&product(2, 10));

        let change = ledger.apply_sale(&sale(2, 3)).unwrap();
        assert_eq!(change.produto_id, 2);
        assert_eq!(change.quantidade_anterior, 10);
        assert_eq!(change.quantidade_atual, 7);
        assert_eq!(change.tipo_movimentacao, TipoMovimentacao::Venda);
        assert_eq!(ledger.quantity(2), Some(7));
    }

    #[test]
    fn oversized_sale_is_refused_without_change() {
        let mut ledger = StockLedger::new();
        ledger.register_product(&product(2, 2));

        assert_eq!(
            ledger.apply_sale(&sale(2, 3)),
            Err(InventoryError::InsufficientStock {
                produto_id: 2,
                available: 2,
                requested: 3
            })
        );
        assert_eq!(ledger.quantity(2), Some(2));
    }

    #[test]
    fn sale_of_unknown_product_is_refused() {
        let mut ledger = StockLedger::new();
        assert_eq!(
            ledger.apply_sale(&sale(9, 1)),
            Err(InventoryError::UnknownProduct(9))
        );
        assert_eq!(
            ledger.apply_sale(&sale(9, 0)),
            Err(InventoryError::InvalidQuantity(0))
        );
    }

    #[test]
    fn check_copies_correlation_id() {
        let mut ledger = StockLedger::new();
        ledger.register_product(&product(2, 5));

        let enough = ledger.check(&VerificarEstoqueCommand {
            produto_id: 2,
            quantidade_solicitada: 5,
            correlation_id: "abc".to_string(),
        });
        assert_eq!(enough.correlation_id, "abc");
        assert!(enough.disponibilidade_suficiente);
        assert_eq!(enough.quantidade_disponivel, 5);

        let short = ledger.check(&VerificarEstoqueCommand {
            produto_id: 2,
            quantidade_solicitada: 6,
            correlation_id: "def".to_string(),
        });
        assert!(!short.disponibilidade_suficiente);

        let missing = ledger.check(&VerificarEstoqueCommand {
            produto_id: 3,
            quantidade_solicitada: 1,
            correlation_id: "ghi".to_string(),
        });
        assert!(!missing.disponibilidade_suficiente);
        assert_eq!(missing.quantidade_disponivel, 0);
    }
}
