use txmq_domain::error::DomainError;

/// 受保护调用的失败：业务自身的错误原样返回，协议错误单独区分
#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum TransactionError<E> {
    #[error("business: {0}")]
    Business(#[source] E),

    #[error("protocol: {0}")]
    Protocol(#[from] DomainError),
}

impl<E> TransactionError<E> {
    pub fn is_business(&self) -> bool {
        matches!(self, Self::Business(_))
    }

    pub fn business(self) -> Option<E> {
        match self {
            Self::Business(err) => Some(err),
            Self::Protocol(_) => None,
        }
    }

    pub fn protocol(&self) -> Option<&DomainError> {
        match self {
            Self::Protocol(err) => Some(err),
            Self::Business(_) => None,
        }
    }
}
