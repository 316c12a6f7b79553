use alloc::string::String;
use alloc::vec::Vec;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use serde::Serialize;

/// The cycle validating the route of a serial instead of pointing it.
pub const VALIDAR_ROTA: &str = "VALIDAR_ROTA";

/// Transport order action pointing the transport itself.
pub const APONTAR_TRANSPORTE: &str = "APONTAR_TRANSPORTE";
/// Transport order action adding the pointed serials to the transport.
pub const ADICIONAR_TRANSPORTE: &str = "ADICIONAR_TRANSPORTE";

/// A product serial code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
pub struct Serial {
    codigo: String,
}

impl Serial {
    /// Creates a [`Serial`] from its code.
    #[must_use]
    #[inline]
    pub fn new(codigo: impl Into<String>) -> Self {
        Self {
            codigo: codigo.into(),
        }
    }

    /// Returns the serial code.
    #[must_use]
    pub fn codigo(&self) -> &str {
        &self.codigo
    }
}

/// A file attached to an [`Apontamento`] as evidence.
///
/// The content travels base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
pub struct Evidence {
    nome: String,
    extensao: String,
    conteudo: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    descricao: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    observacao: String,
}

impl Evidence {
    /// Creates an [`Evidence`] from a name, an extension and an already
    /// base64-encoded content.
    #[must_use]
    #[inline]
    pub fn new(
        nome: impl Into<String>,
        extensao: impl Into<String>,
        conteudo: impl Into<String>,
    ) -> Self {
        Self {
            nome: nome.into(),
            extensao: extensao.into(),
            conteudo: conteudo.into(),
            descricao: String::new(),
            observacao: String::new(),
        }
    }

    /// Creates an [`Evidence`] encoding the given raw bytes.
    #[must_use]
    #[inline]
    pub fn from_bytes(nome: impl Into<String>, extensao: impl Into<String>, bytes: &[u8]) -> Self {
        Self::new(nome, extensao, STANDARD.encode(bytes))
    }

    /// Sets the evidence description.
    #[must_use]
    #[inline]
    pub fn descricao(mut self, descricao: impl Into<String>) -> Self {
        self.descricao = descricao.into();
        self
    }

    /// Sets the evidence observation.
    #[must_use]
    #[inline]
    pub fn observacao(mut self, observacao: impl Into<String>) -> Self {
        self.observacao = observacao.into();
        self
    }

    /// Returns the evidence name.
    #[must_use]
    pub fn nome(&self) -> &str {
        &self.nome
    }

    /// Returns the evidence extension.
    #[must_use]
    pub fn extensao(&self) -> &str {
        &self.extensao
    }

    /// Returns the base64-encoded content.
    #[must_use]
    pub fn conteudo(&self) -> &str {
        &self.conteudo
    }
}

/// A transport order a [`Setup`] refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
pub struct TransportOrder {
    codigo: String,
    acao: String,
}

impl TransportOrder {
    /// Creates a [`TransportOrder`] with the [`APONTAR_TRANSPORTE`] action.
    #[must_use]
    #[inline]
    pub fn new(codigo: impl Into<String>) -> Self {
        Self {
            codigo: codigo.into(),
            acao: APONTAR_TRANSPORTE.into(),
        }
    }

    /// Changes the action performed on the transport order.
    #[must_use]
    #[inline]
    pub fn acao(mut self, acao: impl Into<String>) -> Self {
        self.acao = acao.into();
        self
    }

    /// Returns the transport order code.
    #[must_use]
    pub fn codigo(&self) -> &str {
        &self.codigo
    }
}

/// A check-in event of one serial, or of a group of linked serials.
///
/// Linked serials are bound together by a single event. They are **not**
/// a batch: a batch is made of one [`Apontamento`] per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
pub struct Apontamento {
    ok: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    seriais: Vec<Serial>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    evidencias: Vec<Evidence>,
}

impl Apontamento {
    /// Creates a successful [`Apontamento`] of a single [`Serial`].
    #[must_use]
    #[inline]
    pub fn serial(serial: Serial) -> Self {
        Self::linked([serial])
    }

    /// Creates a successful [`Apontamento`] linking the given serials.
    #[must_use]
    #[inline]
    pub fn linked(seriais: impl IntoIterator<Item = Serial>) -> Self {
        Self {
            ok: true,
            seriais: seriais.into_iter().collect(),
            evidencias: Vec::new(),
        }
    }

    /// Marks the [`Apontamento`] as successful or failed.
    #[must_use]
    #[inline]
    pub fn ok(mut self, ok: bool) -> Self {
        self.ok = ok;
        self
    }

    /// Attaches an [`Evidence`].
    #[must_use]
    #[inline]
    pub fn evidence(mut self, evidence: Evidence) -> Self {
        self.evidencias.push(evidence);
        self
    }

    /// Attaches a sequence of [`Evidence`]s.
    #[must_use]
    #[inline]
    pub fn evidences(mut self, evidences: impl IntoIterator<Item = Evidence>) -> Self {
        self.evidencias.extend(evidences);
        self
    }

    /// Returns the serials of the event.
    #[must_use]
    pub fn seriais(&self) -> &[Serial] {
        &self.seriais
    }
}

/// The document submitted to `setup.apontamento`.
///
/// It bundles the device address, an optional cycle, an optional transport
/// order and the [`Apontamento`]s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    endereco_dispositivo: String,
    apontamentos: Vec<Apontamento>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ciclo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ordem_transporte: Option<TransportOrder>,
}

impl Setup {
    /// Creates an empty [`Setup`] for the device with the given address.
    #[must_use]
    #[inline]
    pub fn new(endereco_dispositivo: impl Into<String>) -> Self {
        Self {
            endereco_dispositivo: endereco_dispositivo.into(),
            apontamentos: Vec::new(),
            ciclo: None,
            ordem_transporte: None,
        }
    }

    /// Adds an [`Apontamento`].
    #[must_use]
    #[inline]
    pub fn apontamento(mut self, apontamento: Apontamento) -> Self {
        self.apontamentos.push(apontamento);
        self
    }

    /// Adds a sequence of [`Apontamento`]s.
    #[must_use]
    #[inline]
    pub fn apontamentos(mut self, apontamentos: impl IntoIterator<Item = Apontamento>) -> Self {
        self.apontamentos.extend(apontamentos);
        self
    }

    /// Sets the cycle, for example [`VALIDAR_ROTA`].
    ///
    /// An empty cycle is not sent.
    #[must_use]
    #[inline]
    pub fn ciclo(mut self, ciclo: impl Into<String>) -> Self {
        let ciclo = ciclo.into();
        self.ciclo = (!ciclo.is_empty()).then_some(ciclo);
        self
    }

    /// Sets the [`TransportOrder`].
    #[must_use]
    #[inline]
    pub fn ordem_transporte(mut self, ordem_transporte: TransportOrder) -> Self {
        self.ordem_transporte = Some(ordem_transporte);
        self
    }

    /// Returns the device address.
    #[must_use]
    pub fn endereco_dispositivo(&self) -> &str {
        &self.endereco_dispositivo
    }

    /// Checks whether the [`Setup`] carries no [`Apontamento`]s.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.apontamentos.is_empty()
    }
}
