use std::any::{TypeId, type_name};
use std::collections::HashMap;

use crate::events::{
    EstoqueAlteradoEvent, EstoqueVerificadoResponse, ProdutoCriadoEvent, VendaRegistradaEvent,
    VerificarEstoqueCommand, queues,
};
use crate::utils::error::BusError;

#[derive(Debug, Clone, Copy)]
struct Binding {
    type_id: TypeId,
    type_name: &'static str,
}

impl Binding {
    fn of<T: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
        }
    }
}

/// Which payload type travels on which queue.
///
/// Filled once at startup and shared read-only afterwards. Publishing or
/// subscribing with a type the queue is not bound to is refused.
#[derive(Debug, Default, Clone)]
pub struct TypeRegistry {
    bindings: HashMap<String, Binding>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The queues exchanged between sales and inventory.
    pub fn standard() -> Self {
        let bindings = [
            (queues::VENDA_REGISTRADA, Binding::of::<VendaRegistradaEvent>()),
            (queues::ESTOQUE_ALTERADO, Binding::of::<EstoqueAlteradoEvent>()),
            (queues::PRODUTO_CRIADO, Binding::of::<ProdutoCriadoEvent>()),
            (queues::VERIFICAR_ESTOQUE, Binding::of::<VerificarEstoqueCommand>()),
            (queues::ESTOQUE_VERIFICADO, Binding::of::<EstoqueVerificadoResponse>()),
        ];
        Self {
            bindings: bindings
                .into_iter()
                .map(|(queue, binding)| (queue.to_string(), binding))
                .collect(),
        }
    }

    /// Binds `queue` to `T`. Binding the same pair again is a no-op.
    pub fn register<T: 'static>(&mut self, queue: &str) -> Result<(), BusError> {
        let binding = Binding::of::<T>();
        match self.bindings.get(queue) {
            Some(existing) if existing.type_id == binding.type_id => Ok(()),
            Some(existing) => Err(BusError::RegistryConflict {
                queue: queue.to_string(),
                existing: existing.type_name,
            }),
            None => {
                self.bindings.insert(queue.to_string(), binding);
                Ok(())
            }
        }
    }

    pub fn check<T: 'static>(&self, queue: &str) -> Result<(), BusError> {
        let binding = self
            .bindings
            .get(queue)
            .ok_or_else(|| BusError::UnregisteredQueue(queue.to_string()))?;
        if binding.type_id != TypeId::of::<T>() {
            return Err(BusError::PayloadTypeMismatch {
                queue: queue.to_string(),
                expected: binding.type_name,
                actual: type_name::<T>(),
            });
        }
        Ok(())
    }

    pub fn type_name(&self, queue: &str) -> Option<&'static str> {
        self.bindings.get(queue).map(|b| b.type_name)
    }

    pub fn queues(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }
}
