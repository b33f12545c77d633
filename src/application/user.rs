use super::store::LedgerStore;
use crate::context::TxContext;
use crate::domain::user::{CreateUserTxParams, CreateUserTxResult};
use crate::error::Result;

impl LedgerStore {
    /// Creates a user and runs `after_create` in the same transaction.
    ///
    /// A failing hook rolls the new user back, so side effects queued by the
    /// hook never refer to a user that does not exist.
    pub async fn create_user_tx(
        &self,
        ctx: &TxContext,
        arg: CreateUserTxParams,
    ) -> Result<CreateUserTxResult> {
        let CreateUserTxParams {
            params,
            after_create,
        } = arg;

        self.exec_tx(ctx, move |q| {
            Box::pin(async move {
                let user = q.create_user(params).await?;
                after_create(&user)?;
                Ok(CreateUserTxResult { user })
            })
        })
        .await
    }
}
